//! The format layer: finding, running and saving file codecs.
//!
//! Native files are handled by the image core itself. Everything else goes
//! through the `image` crate.

use crate::core::error::{FormatError, ImageError, ImageResult};
use crate::core::header::sniff_magic;
use crate::core::storage::Producer;
use crate::core::types::{BandFormat, Coding, Interpretation, Rect};
use crate::execution::image::Image;
use crate::graph::registry::Registry;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageBuffer, ImageFormat, ImageReader};
use log::debug;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;

/// Suffixes of native files.
pub const NATIVE_SUFFIXES: [&str; 2] = ["v", "rkv"];

/// Identifies a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LoaderId(pub &'static str);

/// Identifies a saver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SaverId(pub &'static str);

impl LoaderId {
    pub const NATIVE: LoaderId = LoaderId("native");
}

impl SaverId {
    pub const NATIVE: SaverId = SaverId("native");
}

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl fmt::Display for SaverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Options passed to a loader.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Pixels will be read top to bottom once.
    pub sequential: bool,
}

/// Options passed to a saver.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// JPEG quality, 1 to 100.
    pub quality: Option<u8>,
}

/// Loads and saves files on behalf of the image core.
pub trait FormatLayer: Send + Sync {
    fn find_loader(&self, path: &Path) -> ImageResult<LoaderId>;

    fn find_saver(&self, path: &Path) -> ImageResult<SaverId>;

    /// Open `path`. The result is usually a lazy image.
    fn load(
        &self,
        registry: &Arc<Registry>,
        loader: LoaderId,
        path: &Path,
        options: &LoadOptions,
    ) -> ImageResult<Image>;

    fn save(
        &self,
        saver: SaverId,
        image: &Image,
        path: &Path,
        options: &SaveOptions,
    ) -> ImageResult<()>;
}

/// Whether `path` has a native suffix.
pub fn is_native_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| NATIVE_SUFFIXES.iter().any(|s| e.eq_ignore_ascii_case(s)))
        .unwrap_or(false)
}

/// The default format layer, backed by the `image` crate.
#[derive(Debug, Default)]
pub struct StandardFormats;

impl StandardFormats {
    pub fn new() -> Self {
        Self
    }

    fn image_format(id: &'static str, path: &Path) -> Option<ImageFormat> {
        ImageFormat::from_extension(id).or_else(|| ImageFormat::from_path(path).ok())
    }
}

fn format_id(format: ImageFormat) -> &'static str {
    format.extensions_str().first().copied().unwrap_or("unknown")
}

impl FormatLayer for StandardFormats {
    fn find_loader(&self, path: &Path) -> ImageResult<LoaderId> {
        if sniff_magic(path)?.is_some() {
            return Ok(LoaderId::NATIVE);
        }

        let reader = ImageReader::open(path)
            .map_err(ImageError::io_with(format!("open \"{}\"", path.display())))?
            .with_guessed_format()
            .map_err(ImageError::io_with(format!("read \"{}\"", path.display())))?;

        reader
            .format()
            .map(|f| LoaderId(format_id(f)))
            .ok_or_else(|| {
                FormatError::NoLoader {
                    path: path.display().to_string(),
                }
                .into()
            })
    }

    fn find_saver(&self, path: &Path) -> ImageResult<SaverId> {
        if is_native_path(path) {
            return Ok(SaverId::NATIVE);
        }
        ImageFormat::from_path(path)
            .map(|f| SaverId(format_id(f)))
            .map_err(|_| {
                FormatError::NoSaver {
                    path: path.display().to_string(),
                }
                .into()
            })
    }

    fn load(
        &self,
        registry: &Arc<Registry>,
        loader: LoaderId,
        path: &Path,
        options: &LoadOptions,
    ) -> ImageResult<Image> {
        let name = path.display().to_string();

        if loader == LoaderId::NATIVE {
            let mode = if options.sequential { "rs" } else { "r" };
            return Image::new_mode(registry, &name, mode);
        }

        let format = Self::image_format(loader.0, path)
            .ok_or_else(|| FormatError::NoLoader { path: name.clone() })?;
        let mut reader = ImageReader::open(path)
            .map_err(ImageError::io_with(format!("open \"{}\"", name)))?;
        reader.set_format(format);
        let decoded = reader.decode().map_err(FormatError::from)?;

        let width = decoded.width();
        let height = decoded.height();
        let (bands, band_format, bytes) = unpack(decoded);
        let interpretation = guess_interpretation(bands, band_format);
        debug!(
            "decoded \"{}\" with {}: {}x{}x{} {:?}",
            name, loader, width, height, bands, band_format
        );

        let image = Image::new_named(registry, &name, "p")?;
        image.init_fields(
            width,
            height,
            bands,
            band_format,
            Coding::None,
            interpretation,
            1.0,
            1.0,
        );
        let pel = bands as usize * band_format.sizeof();
        image.generate(Arc::new(DecodedProducer {
            width,
            pel,
            bytes,
        }))?;

        let size = image.sizeof_image();
        let threshold = registry.config().disc_threshold;
        if size > threshold && !options.sequential {
            debug!(
                "\"{}\" is {} bytes, over the {} byte threshold: decoding to disc",
                name, size, threshold
            );
            let disc = Image::new_temp_file(registry, "%s.v")?;
            image.write(&disc)?;
            disc.pio_input()?;
            return Ok(disc);
        }

        Ok(image)
    }

    fn save(
        &self,
        saver: SaverId,
        image: &Image,
        path: &Path,
        options: &SaveOptions,
    ) -> ImageResult<()> {
        let name = path.display().to_string();

        if saver == SaverId::NATIVE {
            let out = Image::new_mode(image.registry(), &name, "w")?;
            return image.write(&out);
        }

        let format = Self::image_format(saver.0, path)
            .ok_or_else(|| FormatError::NoSaver { path: name.clone() })?;
        if image.coding() != Coding::None {
            return Err(unsupported("save", "coded images must be decoded first"));
        }

        let (width, height, bands, band_format) =
            (image.width(), image.height(), image.bands(), image.format());
        let bytes = image.write_to_memory()?;
        let dynamic = pack(width, height, bands, band_format, bytes)?;

        debug!("saving \"{}\" as {:?}", name, format);
        match (format, options.quality) {
            (ImageFormat::Jpeg, Some(quality)) => {
                let file = File::create(path)
                    .map_err(ImageError::io_with(format!("create \"{}\"", name)))?;
                let encoder = JpegEncoder::new_with_quality(BufWriter::new(file), quality);
                dynamic
                    .write_with_encoder(encoder)
                    .map_err(FormatError::from)?;
            }
            _ => dynamic
                .save_with_format(path, format)
                .map_err(FormatError::from)?,
        }
        Ok(())
    }
}

fn unsupported(operation: &str, reason: impl Into<String>) -> ImageError {
    FormatError::Unsupported {
        operation: operation.to_string(),
        reason: reason.into(),
    }
    .into()
}

fn guess_interpretation(bands: u32, format: BandFormat) -> Interpretation {
    match (format, bands) {
        (BandFormat::UChar, 1 | 2) => Interpretation::BW,
        (BandFormat::UChar, _) => Interpretation::Srgb,
        (BandFormat::UShort, 1 | 2) => Interpretation::Grey16,
        (BandFormat::UShort, _) => Interpretation::Rgb16,
        (_, 1 | 2) => Interpretation::BW,
        _ => Interpretation::ScRgb,
    }
}

fn ne_bytes_u16(values: Vec<u16>) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn ne_bytes_f32(values: Vec<f32>) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

/// Split a decoded image into (bands, format, host-order bytes).
fn unpack(decoded: DynamicImage) -> (u32, BandFormat, Vec<u8>) {
    match decoded {
        DynamicImage::ImageLuma8(b) => (1, BandFormat::UChar, b.into_raw()),
        DynamicImage::ImageLumaA8(b) => (2, BandFormat::UChar, b.into_raw()),
        DynamicImage::ImageRgb8(b) => (3, BandFormat::UChar, b.into_raw()),
        DynamicImage::ImageRgba8(b) => (4, BandFormat::UChar, b.into_raw()),
        DynamicImage::ImageLuma16(b) => (1, BandFormat::UShort, ne_bytes_u16(b.into_raw())),
        DynamicImage::ImageLumaA16(b) => (2, BandFormat::UShort, ne_bytes_u16(b.into_raw())),
        DynamicImage::ImageRgb16(b) => (3, BandFormat::UShort, ne_bytes_u16(b.into_raw())),
        DynamicImage::ImageRgba16(b) => (4, BandFormat::UShort, ne_bytes_u16(b.into_raw())),
        DynamicImage::ImageRgb32F(b) => (3, BandFormat::Float, ne_bytes_f32(b.into_raw())),
        DynamicImage::ImageRgba32F(b) => (4, BandFormat::Float, ne_bytes_f32(b.into_raw())),
        other => (4, BandFormat::UChar, other.to_rgba8().into_raw()),
    }
}

/// Build a codec image from host-order pixel bytes.
fn pack(
    width: u32,
    height: u32,
    bands: u32,
    format: BandFormat,
    bytes: Vec<u8>,
) -> ImageResult<DynamicImage> {
    let mismatch = || unsupported("save", "pixel buffer does not match the image size");

    let dynamic = match format {
        BandFormat::UChar => match bands {
            1 => ImageBuffer::from_raw(width, height, bytes).map(DynamicImage::ImageLuma8),
            2 => ImageBuffer::from_raw(width, height, bytes).map(DynamicImage::ImageLumaA8),
            3 => ImageBuffer::from_raw(width, height, bytes).map(DynamicImage::ImageRgb8),
            4 => ImageBuffer::from_raw(width, height, bytes).map(DynamicImage::ImageRgba8),
            _ => return Err(unsupported("save", format!("{} band uchar images", bands))),
        },
        BandFormat::UShort => {
            let values: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_ne_bytes([c[0], c[1]]))
                .collect();
            match bands {
                1 => ImageBuffer::from_raw(width, height, values).map(DynamicImage::ImageLuma16),
                2 => ImageBuffer::from_raw(width, height, values).map(DynamicImage::ImageLumaA16),
                3 => ImageBuffer::from_raw(width, height, values).map(DynamicImage::ImageRgb16),
                4 => ImageBuffer::from_raw(width, height, values).map(DynamicImage::ImageRgba16),
                _ => return Err(unsupported("save", format!("{} band ushort images", bands))),
            }
        }
        BandFormat::Float => {
            let values: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            match bands {
                3 => ImageBuffer::from_raw(width, height, values).map(DynamicImage::ImageRgb32F),
                4 => ImageBuffer::from_raw(width, height, values).map(DynamicImage::ImageRgba32F),
                _ => return Err(unsupported("save", format!("{} band float images", bands))),
            }
        }
        other => return Err(unsupported("save", format!("{:?} images", other))),
    };

    dynamic.ok_or_else(mismatch)
}

/// Serves rects out of a fully decoded image.
struct DecodedProducer {
    width: u32,
    pel: usize,
    bytes: Vec<u8>,
}

impl Producer for DecodedProducer {
    fn produce(&self, rect: Rect) -> ImageResult<Vec<u8>> {
        let line = self.width as usize * self.pel;
        let row = rect.width as usize * self.pel;
        let mut out = Vec::with_capacity(row * rect.height as usize);
        for y in rect.top..rect.bottom() {
            let start = y as usize * line + rect.left as usize * self.pel;
            let src = self.bytes.get(start..start + row).ok_or_else(|| {
                ImageError::evaluation("decoded", format!("rect {:?} outside decoded pixels", rect))
            })?;
            out.extend_from_slice(src);
        }
        Ok(out)
    }

    fn name(&self) -> &str {
        "decoded"
    }
}
