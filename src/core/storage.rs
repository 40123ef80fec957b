//! Physical storage behind a descriptor.
//!
//! Exactly one [`Storage`] variant is active at a time. The payload lives in
//! the variant, so leaving a mode always drops what that mode owned.

use crate::core::error::ImageResult;
use crate::core::types::{Rect, StorageMode};
use memmap2::{Mmap, MmapMut};
use parking_lot::RwLock;
use std::fmt;
use std::fs::File;
use std::sync::Arc;

/// Caller-owned pixel memory shared with an image.
///
/// The image never frees or resizes it; it only reads and writes in place.
pub type ForeignBuffer = Arc<RwLock<Vec<u8>>>;

/// Produces pixels for a lazy image on demand.
///
/// `produce` returns the pixels of `rect` packed row by row, exactly
/// `rect.area() * sizeof_pel` bytes. It may be called from several threads at
/// once for different rects.
pub trait Producer: Send + Sync {
    fn produce(&self, rect: Rect) -> ImageResult<Vec<u8>>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "producer"
    }
}

/// The storage payload of a descriptor.
pub enum Storage {
    /// Nothing attached yet.
    None,
    /// Heap buffer owned by the image. `None` until write-prepare allocates it.
    MemoryOwned(Option<Vec<u8>>),
    MemoryForeign(ForeignBuffer),
    /// Native or raw file opened for reading, with its length in bytes.
    FileOpenRead { file: File, length: u64 },
    /// Native file being written. The file is created lazily by write-prepare.
    FileOpenWrite { file: Option<File> },
    MappedRead { map: Mmap },
    MappedReadWrite { map: MmapMut },
    /// Pixels are computed on demand. `None` until a producer is attached.
    Lazy(Option<Arc<dyn Producer>>),
}

impl Storage {
    pub fn mode(&self) -> StorageMode {
        match self {
            Storage::None => StorageMode::None,
            Storage::MemoryOwned(_) => StorageMode::MemoryOwned,
            Storage::MemoryForeign(_) => StorageMode::MemoryForeign,
            Storage::FileOpenRead { .. } => StorageMode::FileOpenRead,
            Storage::FileOpenWrite { .. } => StorageMode::FileOpenWrite,
            Storage::MappedRead { .. } => StorageMode::MappedRead,
            Storage::MappedReadWrite { .. } => StorageMode::MappedReadWrite,
            Storage::Lazy(_) => StorageMode::Lazy,
        }
    }

    /// Whether pixels can be addressed without computing anything.
    pub fn has_data(&self) -> bool {
        match self {
            Storage::MemoryOwned(buffer) => buffer.is_some(),
            Storage::MemoryForeign(_)
            | Storage::MappedRead { .. }
            | Storage::MappedReadWrite { .. } => true,
            _ => false,
        }
    }

    /// The attached producer of a lazy image.
    pub fn producer(&self) -> Option<Arc<dyn Producer>> {
        match self {
            Storage::Lazy(producer) => producer.clone(),
            _ => None,
        }
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Storage::MemoryOwned(buffer) => f
                .debug_tuple("MemoryOwned")
                .field(&buffer.as_ref().map(|b| b.len()))
                .finish(),
            Storage::MemoryForeign(buffer) => f
                .debug_tuple("MemoryForeign")
                .field(&buffer.read().len())
                .finish(),
            Storage::FileOpenRead { length, .. } => {
                f.debug_struct("FileOpenRead").field("length", length).finish()
            }
            Storage::FileOpenWrite { file } => f
                .debug_struct("FileOpenWrite")
                .field("open", &file.is_some())
                .finish(),
            Storage::MappedRead { map } => {
                f.debug_struct("MappedRead").field("length", &map.len()).finish()
            }
            Storage::MappedReadWrite { map } => f
                .debug_struct("MappedReadWrite")
                .field("length", &map.len())
                .finish(),
            Storage::Lazy(producer) => f
                .debug_tuple("Lazy")
                .field(&producer.as_ref().map(|p| p.name().to_string()))
                .finish(),
            Storage::None => f.write_str("None"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Zeros;

    impl Producer for Zeros {
        fn produce(&self, rect: Rect) -> ImageResult<Vec<u8>> {
            Ok(vec![0; rect.area() as usize])
        }
    }

    #[test]
    fn test_modes_and_data() {
        assert_eq!(Storage::None.mode(), StorageMode::None);
        assert!(!Storage::MemoryOwned(None).has_data());
        assert!(Storage::MemoryOwned(Some(vec![1])).has_data());

        let lazy = Storage::Lazy(Some(Arc::new(Zeros)));
        assert_eq!(lazy.mode(), StorageMode::Lazy);
        assert!(!lazy.has_data());
        assert!(lazy.producer().is_some());
        assert!(Storage::Lazy(None).producer().is_none());
        assert_eq!(format!("{:?}", lazy), "Lazy(Some(\"producer\"))");
    }
}
