//! # Rasterkit - large-image descriptor core
//!
//! Rasterkit is the resource core of a demand-driven image engine. It owns the
//! image descriptor, its storage modes and the transitions between them, the
//! links between images in a pipeline, and the write path that fills images
//! while reporting progress and watching for cancellation.
//!
//! ## Features
//!
//! - **Storage modes**: memory, caller-owned memory, open files, mapped files
//!   and lazily computed images behind one handle
//! - **Mode transitions**: flat and region access contracts, converting
//!   storage (materialize, map, rewind) as needed
//! - **Dependency graph**: weak upstream/downstream links with invalidation
//!   and minimisation walks
//! - **Write pipeline**: pull-based generation and push-based line writes,
//!   with progress events and a cooperative kill flag
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rasterkit::prelude::*;
//!
//! # fn main() -> ImageResult<()> {
//! let registry = Registry::global();
//!
//! // Open a file; nothing is read yet
//! let input = Image::new_from_file(&registry, "input.v")?;
//!
//! // Copy it to a PNG, line by line through regions
//! input.write_to_file("output.png")?;
//!
//! // Or pull the whole thing into memory
//! let bytes = input.write_to_memory()?;
//! assert_eq!(bytes.len() as u64, input.sizeof_image());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: value types, errors, the descriptor, native header, storage
//!   and configuration
//! - [`graph`]: the registry with its link table, and image events
//! - [`execution`]: the image handle, construction, mode transitions, the
//!   write pipeline, progress, regions and the format layer
//!
//! ## Lazy images
//!
//! Implement [`Producer`](core::storage::Producer) to compute pixels on
//! demand:
//!
//! ```rust
//! use rasterkit::prelude::*;
//! use std::sync::Arc;
//!
//! struct Gradient;
//!
//! impl Producer for Gradient {
//!     fn produce(&self, rect: Rect) -> ImageResult<Vec<u8>> {
//!         let mut pixels = Vec::with_capacity(rect.area() as usize);
//!         for _y in rect.top..rect.bottom() {
//!             for x in rect.left..rect.right() {
//!                 pixels.push(x as u8);
//!             }
//!         }
//!         Ok(pixels)
//!     }
//! }
//!
//! # fn main() -> ImageResult<()> {
//! let registry = Registry::new(CoreConfig::default());
//! let image = ImageBuilder::new("p")
//!     .with_size(16, 4, 1)
//!     .with_format(BandFormat::UChar)
//!     .build(&registry)?;
//! image.generate(Arc::new(Gradient))?;
//!
//! let pixels = image.write_to_memory()?;
//! assert_eq!(pixels[5], 5);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod core;
pub mod execution;
pub mod graph;

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```rust,ignore
/// use rasterkit::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use crate::core::types::{
        BandFormat, Coding, DemandStyle, Interpretation, Rect, StorageMode, TileIterator,
    };

    // Descriptor and storage
    pub use crate::core::descriptor::Lifecycle;
    pub use crate::core::header::{ByteOrder, NativeHeader};
    pub use crate::core::storage::{ForeignBuffer, Producer};

    // Configuration
    pub use crate::core::config::{parse_size, set_progress_global, CoreConfig};

    // Errors
    pub use crate::core::error::{
        ConfigError, ConstructionError, ExecutionError, FormatError, ImageError, ImageId,
        ImageResult, ModeError,
    };

    // Graph
    pub use crate::graph::events::{ImageEvent, ListenerId};
    pub use crate::graph::registry::{Direction, Registry};

    // Execution
    pub use crate::execution::build::ImageBuilder;
    pub use crate::execution::format::{FormatLayer, SaveOptions, StandardFormats};
    pub use crate::execution::image::{Image, Pixels};
    pub use crate::execution::progress::{progress_reporter, ProgressSnapshot};
    pub use crate::execution::region::Region;
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
