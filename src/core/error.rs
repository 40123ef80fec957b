//! Error types for rasterkit.
//!
//! Uses thiserror for structured errors with context. The taxonomy follows the
//! way failures are handled by callers:
//! - construction errors abort the build of a descriptor
//! - mode errors fail the requesting call and leave the descriptor untouched
//! - execution errors abort the enclosing pipeline (cancellation included)
//! - I/O errors are propagated with the path or step that failed
//!
//! Nothing in this crate retries; every error goes straight back to the caller.

use crate::core::types::{BandFormat, Coding, Rect, StorageMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Stable identifier of a descriptor inside a [`Registry`](crate::graph::Registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub Uuid);

impl ImageId {
    /// Create a new random image ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an image ID from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ImageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Top-level error type for rasterkit.
///
/// Encompasses all error categories and enables automatic conversion from
/// the specific error types.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Construction error: {0}")]
    Construction(#[from] ConstructionError),

    #[error("Mode error: {0}")]
    Mode(#[from] ModeError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while building a descriptor. No resources survive them.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum ConstructionError {
    #[error("bad mode \"{mode}\"")]
    BadMode { mode: String },

    #[error("header size {size} exceeds the limit of {max} bytes")]
    HeaderTooLarge { size: u64, max: u64 },

    #[error("unable to open \"{path}\", file too short (need {expected} bytes, found {actual})")]
    FileTooShort {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: u64 },

    #[error("buffer too small: should be {expected} bytes, got {actual}")]
    BufferTooSmall { expected: u64, actual: u64 },

    #[error("bad array length: should be {expected}, got {actual}")]
    BadArrayLength { expected: usize, actual: usize },

    #[error("coding {coding:?} is not legal for {bands} band {format:?} images")]
    BadCoding {
        format: BandFormat,
        coding: Coding,
        bands: u32,
    },

    #[error("\"{path}\" is not a native image file")]
    NotNative { path: String },

    #[error("\"{path}\" has a bad header: {reason}")]
    BadHeader { path: String, reason: String },

    #[error("\"{path}\" is not in host byte order and cannot be opened read-write")]
    ForeignByteOrder { path: String },

    #[error("no filename given for mode \"{mode}\"")]
    MissingFilename { mode: String },

    #[error("mode \"{mode}\" needs a foreign buffer")]
    MissingBuffer { mode: String },
}

/// Errors from requesting an access contract the descriptor cannot satisfy.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum ModeError {
    #[error("no image data in \"{image}\"")]
    NoData { image: String },

    #[error("image \"{image}\" already written")]
    AlreadyWritten { image: String },

    #[error("image \"{image}\" is not readable in mode {mode:?}")]
    NotReadable { image: String, mode: StorageMode },

    #[error("unable to output to a {mode:?} image (\"{image}\")")]
    NotWritable { image: String, mode: StorageMode },

    #[error("bad dimensions for \"{image}\": {width}x{height}x{bands}")]
    BadDimensions {
        image: String,
        width: u32,
        height: u32,
        bands: u32,
    },

    #[error("bad image descriptor \"{image}\" in mode {mode:?}")]
    BadDescriptor { image: String, mode: StorageMode },

    #[error("rect {rect:?} lies outside \"{image}\"")]
    RectOutOfBounds { image: String, rect: Rect },

    #[error("line for \"{image}\" too short: need {expected} bytes, got {actual}")]
    LineTooShort {
        image: String,
        expected: usize,
        actual: usize,
    },

    #[error("line {y} out of range for \"{image}\" ({height} lines)")]
    LineOutOfRange { image: String, y: u32, height: u32 },

    #[error("image \"{image}\" is {state}, cannot {operation}")]
    Lifecycle {
        image: String,
        state: String,
        operation: String,
    },
}

/// Errors raised while a pipeline is producing pixels.
///
/// Cancellation is reported as an ordinary [`ExecutionError::Evaluation`]; it
/// can only be told apart by its message (see [`ExecutionError::is_kill`]).
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionError {
    #[error("{message}")]
    Evaluation { image: String, message: String },

    #[error("save of \"{image}\" to \"{path}\" failed: {message}")]
    Save {
        image: String,
        path: String,
        message: String,
    },

    #[error("auto-rewind for \"{image}\" failed: {message}")]
    RewindFailed { image: String, message: String },
}

/// Errors from the format layer.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("\"{path}\" is not a known file format")]
    NoLoader { path: String },

    #[error("\"{path}\" is not a known save format")]
    NoSaver { path: String },

    #[error("unsupported image for {operation}: {reason}")]
    Unsupported { operation: String, reason: String },

    #[error("codec error: {0}")]
    Codec(#[from] image::ImageError),
}

/// Errors in configuration values.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("bad size \"{value}\": expected an integer with optional k, m or g suffix")]
    BadSize { value: String },

    #[error("bad config file: {0}")]
    Toml(#[from] toml::de::Error),
}

// ============================================================================
// Error Utilities
// ============================================================================

const KILL_PREFIX: &str = "killed for image";

impl ExecutionError {
    /// The error reported when the kill flag of `image` is picked up.
    pub fn killed(image: &str) -> Self {
        ExecutionError::Evaluation {
            image: image.to_string(),
            message: format!("{} \"{}\"", KILL_PREFIX, image),
        }
    }

    /// Whether this error came from a kill request.
    pub fn is_kill(&self) -> bool {
        matches!(self, ExecutionError::Evaluation { message, .. } if message.starts_with(KILL_PREFIX))
    }

    /// Name of the image the error was raised for.
    pub fn image(&self) -> &str {
        match self {
            ExecutionError::Evaluation { image, .. }
            | ExecutionError::Save { image, .. }
            | ExecutionError::RewindFailed { image, .. } => image,
        }
    }
}

impl ModeError {
    pub fn image(&self) -> &str {
        match self {
            ModeError::NoData { image }
            | ModeError::AlreadyWritten { image }
            | ModeError::NotReadable { image, .. }
            | ModeError::NotWritable { image, .. }
            | ModeError::BadDimensions { image, .. }
            | ModeError::BadDescriptor { image, .. }
            | ModeError::RectOutOfBounds { image, .. }
            | ModeError::LineTooShort { image, .. }
            | ModeError::LineOutOfRange { image, .. }
            | ModeError::Lifecycle { image, .. } => image,
        }
    }
}

impl ImageError {
    /// Wrap an I/O error with a description of what was being done.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ImageError::Io {
            context: context.into(),
            source,
        }
    }

    /// Adapter for `map_err` on I/O results.
    pub fn io_with(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> ImageError {
        let context = context.into();
        move |source| ImageError::Io { context, source }
    }

    /// Whether this error came from a kill request.
    pub fn is_kill(&self) -> bool {
        matches!(self, ImageError::Execution(e) if e.is_kill())
    }

    /// Name of the image the error concerns, where it names one.
    pub fn image_name(&self) -> Option<&str> {
        match self {
            ImageError::Execution(e) => Some(e.image()),
            ImageError::Mode(e) => Some(e.image()),
            _ => None,
        }
    }

    /// Convenience constructor for an evaluation failure.
    pub fn evaluation(image: &str, message: impl Into<String>) -> Self {
        ImageError::Execution(ExecutionError::Evaluation {
            image: image.to_string(),
            message: message.into(),
        })
    }
}

/// Result type alias for rasterkit operations.
pub type ImageResult<T> = Result<T, ImageError>;
