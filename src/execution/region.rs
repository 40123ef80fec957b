//! A minimal region engine.
//!
//! A [`Region`] asks an image for one rectangle at a time and keeps a copy of
//! the last rectangle it prepared. Regions are registered with the image's
//! registry while they live, so invalidation can reach their caches and
//! teardown can warn about regions left behind.

use crate::core::error::{ImageError, ImageResult, ModeError};
use crate::core::storage::Storage;
use crate::core::types::Rect;
use crate::execution::image::Image;
use crate::graph::registry::RegionId;
use log::debug;
use memmap2::MmapOptions;
use parking_lot::Mutex;
use std::sync::Arc;

/// Pixels held by one region.
#[derive(Debug, Default)]
pub struct RegionCache {
    pixels: Option<(Rect, Vec<u8>)>,
}

impl RegionCache {
    /// Forget the cached rectangle.
    pub fn clear(&mut self) {
        self.pixels = None;
    }

    pub fn rect(&self) -> Option<Rect> {
        self.pixels.as_ref().map(|(rect, _)| *rect)
    }
}

/// Incremental read access to one image.
pub struct Region {
    id: RegionId,
    image: Image,
    cache: Arc<Mutex<RegionCache>>,
}

impl Region {
    pub fn new(image: &Image) -> Self {
        let cache = Arc::new(Mutex::new(RegionCache::default()));
        let id = image
            .registry()
            .add_region(image.id(), Arc::downgrade(&cache));
        Self {
            id,
            image: image.clone(),
            cache,
        }
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Make the pixels of `rect` available through this region.
    pub fn prepare(&self, rect: Rect) -> ImageResult<()> {
        let pixels = self.image.read_rect(rect)?;
        self.cache.lock().pixels = Some((rect, pixels));
        Ok(())
    }

    /// The rectangle currently held, if it has not been invalidated.
    pub fn valid(&self) -> Option<Rect> {
        self.cache.lock().rect()
    }

    /// Run `f` over the held rectangle and its pixels.
    pub fn with_pixels<T>(&self, f: impl FnOnce(Rect, &[u8]) -> T) -> Option<T> {
        let cache = self.cache.lock();
        cache
            .pixels
            .as_ref()
            .map(|(rect, pixels)| f(*rect, pixels))
    }

    /// Move the held pixels out, leaving the region empty.
    pub fn take_pixels(&self) -> Option<(Rect, Vec<u8>)> {
        self.cache.lock().pixels.take()
    }

    /// Prepare `rect` and hand its pixels over.
    pub fn fetch(&self, rect: Rect) -> ImageResult<Vec<u8>> {
        self.prepare(rect)?;
        self.take_pixels()
            .map(|(_, pixels)| pixels)
            .ok_or_else(|| {
                ModeError::NoData {
                    image: self.image.filename(),
                }
                .into()
            })
    }

    pub fn invalidate(&self) {
        self.cache.lock().clear();
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.image.registry().remove_region(self.image.id(), self.id);
    }
}

/// Copy the rows of `rect` out of a flat array with `line` bytes per row.
fn copy_rows(data: &[u8], rect: Rect, line: usize, pel: usize) -> Vec<u8> {
    let row = rect.width as usize * pel;
    let mut out = Vec::with_capacity(row * rect.height as usize);
    for y in rect.top..rect.bottom() {
        let start = y as usize * line + rect.left as usize * pel;
        out.extend_from_slice(&data[start..start + row]);
    }
    out
}

impl Image {
    /// The pixels of `rect`, packed row by row.
    pub(crate) fn read_rect(&self, rect: Rect) -> ImageResult<Vec<u8>> {
        self.pio_input()?;

        enum Source {
            Done(Vec<u8>),
            Foreign(crate::core::storage::ForeignBuffer),
            Window(std::fs::File, u64),
            Producer(Arc<dyn crate::core::storage::Producer>),
        }

        let (name, line, pel, source) = {
            let state = self.state();
            if !rect.is_within_bounds(state.width, state.height) || rect.is_empty() {
                return Err(ModeError::RectOutOfBounds {
                    image: state.filename.clone(),
                    rect,
                }
                .into());
            }
            let line = state.sizeof_line();
            let pel = state.sizeof_pel();

            let source = if let Some(data) = state.data() {
                Source::Done(copy_rows(data, rect, line, pel))
            } else {
                match &state.storage {
                    Storage::MemoryForeign(buffer) => Source::Foreign(buffer.clone()),
                    Storage::FileOpenRead { file, .. } => {
                        let file = file.try_clone().map_err(ImageError::io_with(format!(
                            "open window on \"{}\"",
                            state.filename
                        )))?;
                        Source::Window(file, state.header_size)
                    }
                    Storage::Lazy(Some(producer)) => Source::Producer(producer.clone()),
                    other => {
                        return Err(ModeError::NotReadable {
                            image: state.filename.clone(),
                            mode: other.mode(),
                        }
                        .into())
                    }
                }
            };
            (state.filename.clone(), line, pel, source)
        };

        let pixels = match source {
            Source::Done(pixels) => pixels,
            Source::Foreign(buffer) => {
                let guard = buffer.read();
                let needed = (rect.bottom() as usize - 1) * line + rect.right() as usize * pel;
                if guard.len() < needed {
                    return Err(ModeError::NoData { image: name }.into());
                }
                copy_rows(&guard, rect, line, pel)
            }
            Source::Window(file, header_size) => {
                self.read_window(&file, header_size, rect, line, pel)?
            }
            Source::Producer(producer) => {
                let pixels = producer.produce(rect)?;
                let expected = rect.area() as usize * pel;
                if pixels.len() != expected {
                    return Err(ImageError::evaluation(
                        &name,
                        format!(
                            "{} produced {} bytes for {:?}, expected {}",
                            producer.name(),
                            pixels.len(),
                            rect,
                            expected
                        ),
                    ));
                }
                pixels
            }
        };
        Ok(pixels)
    }

    /// Map just the rows of `rect` and copy them out.
    fn read_window(
        &self,
        file: &std::fs::File,
        header_size: u64,
        rect: Rect,
        line: usize,
        pel: usize,
    ) -> ImageResult<Vec<u8>> {
        let offset = header_size + rect.top as u64 * line as u64;
        let len = rect.height as usize * line;

        self.registry().add_window(self.id());
        // SAFETY: the window is private to this call and dropped before it
        // returns; the file is not truncated while the image is open.
        let window = unsafe { MmapOptions::new().offset(offset).len(len).map(file) };
        let result = window
            .map(|map| {
                debug!(
                    "window on \"{}\" at {} for {} lines",
                    self.filename(),
                    offset,
                    rect.height
                );
                let local = Rect::new(rect.left, 0, rect.width, rect.height);
                copy_rows(&map[..], local, line, pel)
            })
            .map_err(ImageError::io_with(format!("map window on \"{}\"", self.filename())));
        self.registry().remove_window(self.id());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CoreConfig;
    use crate::core::types::BandFormat;
    use crate::graph::registry::Registry;
    use parking_lot::RwLock;

    fn ramp(registry: &Arc<Registry>, width: u32, height: u32) -> Image {
        let bytes: Vec<u8> = (0..width * height).map(|v| v as u8).collect();
        let buffer = Arc::new(RwLock::new(bytes));
        Image::new_from_memory(registry, buffer, 0, width, height, 1, BandFormat::UChar).unwrap()
    }

    #[test]
    fn test_prepare_copies_rect() {
        let registry = Registry::new(CoreConfig::default());
        let image = ramp(&registry, 4, 3);
        let region = Region::new(&image);
        assert_eq!(registry.region_count(image.id()), 1);

        region.prepare(Rect::new(1, 1, 2, 2)).unwrap();
        assert_eq!(region.valid(), Some(Rect::new(1, 1, 2, 2)));
        let pixels = region.with_pixels(|_, p| p.to_vec()).unwrap();
        assert_eq!(pixels, vec![5, 6, 9, 10]);

        drop(region);
        assert_eq!(registry.region_count(image.id()), 0);
    }

    #[test]
    fn test_out_of_bounds() {
        let registry = Registry::new(CoreConfig::default());
        let image = ramp(&registry, 4, 3);
        let region = Region::new(&image);
        assert!(region.prepare(Rect::new(3, 0, 2, 1)).is_err());
        assert!(region.prepare(Rect::new(0, 0, 0, 1)).is_err());
        assert!(region.valid().is_none());
    }

    #[test]
    fn test_invalidate_all_clears_caches() {
        let registry = Registry::new(CoreConfig::default());
        let image = ramp(&registry, 4, 3);
        let region = Region::new(&image);
        region.prepare(Rect::new(0, 0, 4, 1)).unwrap();

        image.invalidate_all();
        assert!(region.valid().is_none());

        region.prepare(Rect::new(0, 0, 4, 1)).unwrap();
        region.invalidate();
        assert!(region.valid().is_none());
    }
}
