//! Execution module.
//!
//! This module holds the shared [`Image`] handle and everything that moves
//! pixels through it: construction, mode transitions, the write pipeline,
//! progress, the region shim and the format layer.

pub mod build;
pub mod format;
pub mod image;
pub mod pipeline;
pub mod progress;
pub mod region;
pub mod transition;

pub use build::{ImageBuilder, OpenMode};
pub use format::{FormatLayer, LoadOptions, LoaderId, SaveOptions, SaverId, StandardFormats};
pub use image::{Image, Pixels};
pub use progress::{progress_reporter, Progress, ProgressSnapshot};
pub use region::{Region, RegionCache};
