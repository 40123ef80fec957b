//! Graph module for the links between images.
//!
//! Images that read from each other form a directed graph. The registry
//! keeps its edges; invalidation and minimisation walk them.

pub mod events;
pub mod registry;

// Re-export commonly used types
pub use events::{ImageEvent, Listener, ListenerId, Listeners};
pub use registry::{Direction, LinkTable, LinkViolation, Registry, RegionId};
