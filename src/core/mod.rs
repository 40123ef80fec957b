//! Core types for the rasterkit image core.
//!
//! This module contains the foundational pieces every image is made of:
//! - Value types (band formats, codings, storage modes, rects)
//! - The native file header
//! - Storage payloads and the descriptor itself
//! - Configuration
//! - Error types

pub mod config;
pub mod descriptor;
pub mod error;
pub mod header;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use config::{parse_size, progress_global, set_progress_global, CoreConfig};
pub use descriptor::{Descriptor, Lifecycle};
pub use error::{
    ConfigError, ConstructionError, ExecutionError, FormatError, ImageError, ImageId, ImageResult,
    ModeError,
};
pub use header::{byteswap, sniff_magic, ByteOrder, NativeHeader};
pub use storage::{ForeignBuffer, Producer, Storage};
pub use types::{BandFormat, Coding, DemandStyle, Interpretation, Rect, StorageMode, TileIterator};
