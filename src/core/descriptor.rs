//! The image descriptor: header fields, storage and lifecycle.
//!
//! A [`Descriptor`] is plain data. Sharing, locking and graph membership are
//! added by [`Image`](crate::execution::Image), which owns one descriptor
//! behind a lock.

use crate::core::error::{ImageError, ImageResult, ModeError};
use crate::core::header::{ByteOrder, NativeHeader, SIZEOF_HEADER};
use crate::core::storage::Storage;
use crate::core::types::{BandFormat, Coding, DemandStyle, Interpretation, StorageMode};
use crate::execution::format::SaverId;
use log::{debug, warn};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Teardown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    Live,
    /// Files closed and maps undone. A rewind may make it live again.
    Disposed,
    /// Buffers freed. Nothing is valid any more.
    Finalized,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Live => f.write_str("live"),
            Lifecycle::Disposed => f.write_str("disposed"),
            Lifecycle::Finalized => f.write_str("finalized"),
        }
    }
}

/// Header fields and storage of one image.
#[derive(Debug)]
pub struct Descriptor {
    pub width: u32,
    pub height: u32,
    pub bands: u32,
    pub format: BandFormat,
    pub coding: Coding,
    pub interpretation: Interpretation,
    pub xres: f64,
    pub yres: f64,
    pub xoffset: i32,
    pub yoffset: i32,

    /// Set once at construction.
    pub filename: String,
    /// The construction mode string, set once.
    pub mode: String,
    pub demand: DemandStyle,
    /// Bytes before the first pixel in file-backed modes.
    pub header_size: u64,
    /// Byte order of the pixels in the backing file.
    pub byte_order: ByteOrder,
    /// Access is expected to be top-to-bottom only.
    pub sequential: bool,

    pub storage: Storage,
    pub lifecycle: Lifecycle,

    /// File to remove at finalize.
    pub delete_on_close: Option<PathBuf>,
    /// Saver to run when a lazy write target is written.
    pub deferred_save: Option<SaverId>,
}

/// Serializable view used by [`Descriptor::dump`].
#[derive(Debug, Serialize)]
struct DescriptorDump<'a> {
    filename: &'a str,
    mode: &'a str,
    width: u32,
    height: u32,
    bands: u32,
    format: BandFormat,
    coding: Coding,
    interpretation: Interpretation,
    xres: f64,
    yres: f64,
    xoffset: i32,
    yoffset: i32,
    demand: DemandStyle,
    storage: StorageMode,
    header_size: u64,
    byte_order: ByteOrder,
    lifecycle: Lifecycle,
    delete_on_close: bool,
    sizeof_image: u64,
}

impl Descriptor {
    /// An unused descriptor: zero geometry and no storage.
    pub fn new(filename: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            width: 0,
            height: 0,
            bands: 0,
            format: BandFormat::UChar,
            coding: Coding::None,
            interpretation: Interpretation::Multiband,
            xres: 1.0,
            yres: 1.0,
            xoffset: 0,
            yoffset: 0,
            filename: filename.into(),
            mode: mode.into(),
            demand: DemandStyle::Any,
            header_size: 0,
            byte_order: ByteOrder::host(),
            sequential: false,
            storage: Storage::None,
            lifecycle: Lifecycle::Live,
            delete_on_close: None,
            deferred_save: None,
        }
    }

    // ========================================================================
    // Geometry
    // ========================================================================

    pub fn sizeof_element(&self) -> usize {
        self.format.sizeof()
    }

    pub fn sizeof_pel(&self) -> usize {
        self.sizeof_element() * self.bands as usize
    }

    pub fn sizeof_line(&self) -> usize {
        self.sizeof_pel() * self.width as usize
    }

    pub fn sizeof_image(&self) -> u64 {
        self.sizeof_line() as u64 * self.height as u64
    }

    pub fn n_pels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn n_elements(&self) -> u64 {
        self.n_pels() * self.bands as u64
    }

    /// All three dimensions positive.
    pub fn has_geometry(&self) -> bool {
        self.width > 0 && self.height > 0 && self.bands > 0
    }

    /// Fail unless all three dimensions are positive.
    pub fn check_geometry(&self) -> Result<(), ModeError> {
        if self.has_geometry() {
            Ok(())
        } else {
            Err(ModeError::BadDimensions {
                image: self.filename.clone(),
                width: self.width,
                height: self.height,
                bands: self.bands,
            })
        }
    }

    /// Copy the geometry and format fields of `other`.
    pub fn copy_fields(&mut self, other: &Descriptor) {
        self.width = other.width;
        self.height = other.height;
        self.bands = other.bands;
        self.format = other.format;
        self.coding = other.coding;
        self.interpretation = other.interpretation;
        self.xres = other.xres;
        self.yres = other.yres;
        self.xoffset = other.xoffset;
        self.yoffset = other.yoffset;
    }

    // ========================================================================
    // Native header
    // ========================================================================

    /// The native header for these fields in host byte order.
    pub fn native_header(&self) -> NativeHeader {
        NativeHeader {
            byte_order: ByteOrder::host(),
            width: self.width,
            height: self.height,
            bands: self.bands,
            format: self.format,
            coding: self.coding,
            interpretation: self.interpretation,
            xres: self.xres as f32,
            yres: self.yres as f32,
            xoffset: self.xoffset,
            yoffset: self.yoffset,
        }
    }

    /// Take the fields of a header read from a native file.
    pub fn apply_header(&mut self, header: &NativeHeader) {
        self.width = header.width;
        self.height = header.height;
        self.bands = header.bands;
        self.format = header.format;
        self.coding = header.coding;
        self.interpretation = header.interpretation;
        self.xres = header.xres as f64;
        self.yres = header.yres as f64;
        self.xoffset = header.xoffset;
        self.yoffset = header.yoffset;
        self.byte_order = header.byte_order;
        self.header_size = SIZEOF_HEADER as u64;
    }

    // ========================================================================
    // Pixel access
    // ========================================================================

    /// The flat pixel array, for modes that hold one locally.
    ///
    /// Foreign buffers live outside the descriptor and are not returned here.
    pub fn data(&self) -> Option<&[u8]> {
        let size = self.sizeof_image() as usize;
        let start = self.header_size as usize;
        match &self.storage {
            Storage::MemoryOwned(Some(buffer)) => buffer.get(..size),
            Storage::MappedRead { map } => map.get(start..start + size),
            Storage::MappedReadWrite { map } => map.get(start..start + size),
            _ => None,
        }
    }

    /// Writable flat pixel array, for memory and read-write mapped modes.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        let size = self.sizeof_image() as usize;
        let start = self.header_size as usize;
        match &mut self.storage {
            Storage::MemoryOwned(Some(buffer)) => buffer.get_mut(..size),
            Storage::MappedReadWrite { map } => map.get_mut(start..start + size),
            _ => None,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Fail if the descriptor is no longer live.
    pub fn check_live(&self, operation: &str) -> Result<(), ModeError> {
        match self.lifecycle {
            Lifecycle::Live => Ok(()),
            state => Err(ModeError::Lifecycle {
                image: self.filename.clone(),
                state: state.to_string(),
                operation: operation.to_string(),
            }),
        }
    }

    /// Close files and undo maps. Safe to call more than once.
    ///
    /// Memory buffers and producers survive; a rewind may rebuild file
    /// storage and make the descriptor live again.
    pub fn dispose(&mut self) {
        if self.lifecycle == Lifecycle::Finalized {
            return;
        }
        if self.storage.mode().is_file() {
            debug!("dispose: closing \"{}\"", self.filename);
            if let Storage::MappedReadWrite { map } = &self.storage {
                if let Err(e) = map.flush() {
                    warn!("unable to flush \"{}\": {}", self.filename, e);
                }
            }
            self.storage = Storage::None;
        }
        self.lifecycle = Lifecycle::Disposed;
    }

    /// Free buffers, drop the producer and remove a delete-on-close file.
    ///
    /// Only valid after [`dispose`](Self::dispose).
    pub fn finalize(&mut self) -> ImageResult<()> {
        if self.lifecycle != Lifecycle::Disposed {
            return Err(ModeError::Lifecycle {
                image: self.filename.clone(),
                state: self.lifecycle.to_string(),
                operation: "finalize".to_string(),
            }
            .into());
        }

        self.storage = Storage::None;
        self.deferred_save = None;
        self.lifecycle = Lifecycle::Finalized;

        if let Some(path) = self.delete_on_close.take() {
            debug!("finalize: removing \"{}\"", path.display());
            std::fs::remove_file(&path)
                .map_err(ImageError::io_with(format!("unlink \"{}\"", path.display())))?;
        }

        Ok(())
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Problems with this descriptor's fields, empty if none.
    pub fn sanity(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let zero = [self.width, self.height, self.bands]
            .iter()
            .filter(|d| **d == 0)
            .count();
        if zero != 0 && zero != 3 {
            problems.push(format!(
                "bad dimensions {}x{}x{}",
                self.width, self.height, self.bands
            ));
        }

        if !self.coding.is_legal(self.format, self.bands) && self.has_geometry() {
            problems.push(format!(
                "bad enum: {:?} coding on {} band {:?}",
                self.coding, self.bands, self.format
            ));
        }

        if !(self.xres.is_finite() && self.xres >= 0.0 && self.yres.is_finite() && self.yres >= 0.0)
        {
            problems.push(format!("bad resolution {} x {}", self.xres, self.yres));
        }

        if let Storage::MemoryOwned(Some(buffer)) = &self.storage {
            if (buffer.len() as u64) < self.sizeof_image() {
                problems.push(format!(
                    "buffer of {} bytes is smaller than the image",
                    buffer.len()
                ));
            }
        }

        problems
    }

    /// One-line description.
    pub fn summary(&self) -> String {
        format!(
            "{}: {}x{} {:?}, {} band{}, {:?}, {}",
            self.filename,
            self.width,
            self.height,
            self.format,
            self.bands,
            if self.bands == 1 { "" } else { "s" },
            self.interpretation,
            self.storage.mode(),
        )
    }

    /// Header fields and mode as JSON.
    pub fn dump(&self) -> serde_json::Value {
        let view = DescriptorDump {
            filename: &self.filename,
            mode: &self.mode,
            width: self.width,
            height: self.height,
            bands: self.bands,
            format: self.format,
            coding: self.coding,
            interpretation: self.interpretation,
            xres: self.xres,
            yres: self.yres,
            xoffset: self.xoffset,
            yoffset: self.yoffset,
            demand: self.demand,
            storage: self.storage.mode(),
            header_size: self.header_size,
            byte_order: self.byte_order,
            lifecycle: self.lifecycle,
            delete_on_close: self.delete_on_close.is_some(),
            sizeof_image: self.sizeof_image(),
        };
        serde_json::to_value(view).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized(width: u32, height: u32, bands: u32, format: BandFormat) -> Descriptor {
        let mut desc = Descriptor::new("test", "t");
        desc.width = width;
        desc.height = height;
        desc.bands = bands;
        desc.format = format;
        desc
    }

    #[test]
    fn test_sizes() {
        let desc = sized(10, 4, 3, BandFormat::UShort);
        assert_eq!(desc.sizeof_pel(), 6);
        assert_eq!(desc.sizeof_line(), 60);
        assert_eq!(desc.sizeof_image(), 240);
        assert_eq!(desc.n_pels(), 40);
        assert_eq!(desc.n_elements(), 120);
    }

    #[test]
    fn test_sanity() {
        assert!(Descriptor::new("fresh", "p").sanity().is_empty());

        let half = sized(10, 0, 1, BandFormat::UChar);
        assert_eq!(half.sanity().len(), 1);

        let mut coded = sized(4, 4, 3, BandFormat::UChar);
        coded.coding = Coding::LabQ;
        assert!(coded.sanity()[0].contains("bad enum"));

        let mut res = sized(4, 4, 1, BandFormat::UChar);
        res.xres = -1.0;
        assert!(res.sanity()[0].contains("resolution"));
    }

    #[test]
    fn test_data_views() {
        let mut desc = sized(2, 2, 1, BandFormat::UChar);
        assert!(desc.data().is_none());
        desc.storage = Storage::MemoryOwned(Some(vec![1, 2, 3, 4]));
        assert_eq!(desc.data(), Some(&[1u8, 2, 3, 4][..]));
        desc.data_mut().unwrap()[0] = 9;
        assert_eq!(desc.data().unwrap()[0], 9);
    }

    #[test]
    fn test_two_phase_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doomed.v");
        std::fs::write(&path, b"x").unwrap();

        let mut desc = sized(1, 1, 1, BandFormat::UChar);
        desc.storage = Storage::MemoryOwned(Some(vec![0]));
        desc.delete_on_close = Some(path.clone());

        assert!(desc.finalize().is_err());
        desc.dispose();
        desc.dispose();
        assert_eq!(desc.lifecycle, Lifecycle::Disposed);
        assert!(desc.data().is_some());

        desc.finalize().unwrap();
        assert_eq!(desc.lifecycle, Lifecycle::Finalized);
        assert!(!path.exists());
        assert!(desc.finalize().is_err());
    }

    #[test]
    fn test_dump() {
        let desc = sized(3, 2, 1, BandFormat::Float);
        let dump = desc.dump();
        assert_eq!(dump["width"], 3);
        assert_eq!(dump["format"], "float");
        assert_eq!(dump["storage"], "None");
        assert_eq!(dump["sizeof_image"], 24);
    }
}
