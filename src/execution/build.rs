//! Building images: mode strings, named construction and the constructors.
//!
//! A build first registers an unused image, then performs the I/O the mode
//! asks for. If that fails the half-built image is dropped, which closes
//! anything it opened.

use crate::core::error::{ConstructionError, ImageError, ImageResult, ModeError};
use crate::core::header::{sniff_magic, ByteOrder, NativeHeader, MAX_HEADER_SIZE, SIZEOF_HEADER};
use crate::core::storage::{ForeignBuffer, Producer, Storage};
use crate::core::types::{BandFormat, Coding, DemandStyle, Interpretation, Rect};
use crate::execution::format::{LoadOptions, SaverId};
use crate::execution::image::Image;
use crate::execution::progress::progress_reporter;
use crate::execution::region::Region;
use crate::graph::registry::Registry;
use log::{debug, warn};
use memmap2::MmapOptions;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

/// The construction modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `"r"`: open a native or foreign file for reading.
    Read,
    /// `"rs"`: read, top to bottom only.
    ReadSequential,
    /// `"rw"`: map a native file read-write.
    ReadWrite,
    /// `"w"`: write a file; native directly, anything else via a saver.
    Write,
    /// `"t"`: memory image, allocated at write-prepare.
    TempMemory,
    /// `"p"`: lazy image.
    Lazy,
    /// `"a"`: headerless file with caller-given geometry.
    Raw,
    /// `"m"`: caller-owned memory.
    ForeignMemory,
    /// `"v"`: native file already known to be valid; no sniffing.
    Native,
}

impl OpenMode {
    pub fn parse(mode: &str) -> Result<Self, ConstructionError> {
        match mode {
            "r" => Ok(OpenMode::Read),
            "rs" => Ok(OpenMode::ReadSequential),
            "rw" => Ok(OpenMode::ReadWrite),
            "w" => Ok(OpenMode::Write),
            "t" => Ok(OpenMode::TempMemory),
            "p" => Ok(OpenMode::Lazy),
            "a" => Ok(OpenMode::Raw),
            "m" => Ok(OpenMode::ForeignMemory),
            "v" => Ok(OpenMode::Native),
            _ => Err(ConstructionError::BadMode {
                mode: mode.to_string(),
            }),
        }
    }

    /// Whether the mode needs a filename.
    pub fn needs_file(self) -> bool {
        matches!(
            self,
            OpenMode::Read
                | OpenMode::ReadSequential
                | OpenMode::ReadWrite
                | OpenMode::Write
                | OpenMode::Raw
                | OpenMode::Native
        )
    }
}

/// Named construction of an image.
///
/// Every field is optional; the mode decides which ones are used.
#[derive(Clone)]
pub struct ImageBuilder {
    filename: Option<String>,
    mode: String,
    width: u32,
    height: u32,
    bands: u32,
    format: BandFormat,
    coding: Coding,
    interpretation: Option<Interpretation>,
    xres: f64,
    yres: f64,
    xoffset: i32,
    yoffset: i32,
    demand: DemandStyle,
    kill: bool,
    header_size: u64,
    foreign: Option<ForeignBuffer>,
    /// Size the caller claims the foreign buffer has. Zero means unchecked.
    foreign_size: u64,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self {
            filename: None,
            mode: "p".to_string(),
            width: 0,
            height: 0,
            bands: 0,
            format: BandFormat::UChar,
            coding: Coding::None,
            interpretation: None,
            xres: 1.0,
            yres: 1.0,
            xoffset: 0,
            yoffset: 0,
            demand: DemandStyle::Any,
            kill: false,
            header_size: 0,
            foreign: None,
            foreign_size: 0,
        }
    }
}

impl ImageBuilder {
    pub fn new(mode: &str) -> Self {
        Self {
            mode: mode.to_string(),
            ..Self::default()
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_size(mut self, width: u32, height: u32, bands: u32) -> Self {
        self.width = width;
        self.height = height;
        self.bands = bands;
        self
    }

    pub fn with_format(mut self, format: BandFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_coding(mut self, coding: Coding) -> Self {
        self.coding = coding;
        self
    }

    pub fn with_interpretation(mut self, interpretation: Interpretation) -> Self {
        self.interpretation = Some(interpretation);
        self
    }

    pub fn with_resolution(mut self, xres: f64, yres: f64) -> Self {
        self.xres = xres;
        self.yres = yres;
        self
    }

    pub fn with_offset(mut self, xoffset: i32, yoffset: i32) -> Self {
        self.xoffset = xoffset;
        self.yoffset = yoffset;
        self
    }

    pub fn with_demand(mut self, demand: DemandStyle) -> Self {
        self.demand = demand;
        self
    }

    pub fn with_kill(mut self, kill: bool) -> Self {
        self.kill = kill;
        self
    }

    /// Bytes to skip before the pixels of a raw file.
    pub fn with_header_size(mut self, header_size: u64) -> Self {
        self.header_size = header_size;
        self
    }

    /// Caller-owned pixels, and the size the caller says they have.
    pub fn with_foreign(mut self, buffer: ForeignBuffer, size: u64) -> Self {
        self.foreign = Some(buffer);
        self.foreign_size = size;
        self
    }

    /// Build the image.
    pub fn build(self, registry: &Arc<Registry>) -> ImageResult<Image> {
        let mode = OpenMode::parse(&self.mode)?;

        if self.header_size > MAX_HEADER_SIZE {
            return Err(ConstructionError::HeaderTooLarge {
                size: self.header_size,
                max: MAX_HEADER_SIZE,
            }
            .into());
        }

        let filename = match (&self.filename, mode.needs_file()) {
            (Some(name), _) => name.clone(),
            (None, true) => {
                return Err(ConstructionError::MissingFilename {
                    mode: self.mode.clone(),
                }
                .into())
            }
            (None, false) => registry.next_name("temp"),
        };

        let image = Image::blank(registry, &filename, &self.mode);
        {
            let mut state = image.state_mut();
            state.width = self.width;
            state.height = self.height;
            state.bands = self.bands;
            state.format = self.format;
            state.coding = self.coding;
            state.interpretation = self.interpretation.unwrap_or_default();
            state.xres = self.xres;
            state.yres = self.yres;
            state.xoffset = self.xoffset;
            state.yoffset = self.yoffset;
            state.demand = self.demand;
            state.header_size = self.header_size;
            state.sequential = mode == OpenMode::ReadSequential;
        }
        image.set_kill(self.kill);

        let path = Path::new(&filename);
        match mode {
            OpenMode::Read | OpenMode::ReadSequential => {
                build_read(&image, path, mode == OpenMode::ReadSequential)?
            }
            OpenMode::ReadWrite => build_read_write(&image, path)?,
            OpenMode::Write => build_write(&image, path)?,
            OpenMode::TempMemory => image.state_mut().storage = Storage::MemoryOwned(None),
            OpenMode::Lazy => image.state_mut().storage = Storage::Lazy(None),
            OpenMode::Raw => build_raw(&image, path, self.interpretation.is_none())?,
            OpenMode::ForeignMemory => build_foreign(
                &image,
                self.foreign,
                self.foreign_size,
                self.interpretation.is_none(),
            )?,
            OpenMode::Native => {
                let file = File::open(path)
                    .map_err(ImageError::io_with(format!("open \"{}\"", filename)))?;
                open_native(&image, file)?
            }
        }

        debug!("built {}", image.summary());
        Ok(image)
    }
}

// ============================================================================
// Per-mode builds
// ============================================================================

/// Read the header from `file` and make `image` a readable native file.
///
/// The file may be in either byte order.
pub(crate) fn open_native(image: &Image, mut file: File) -> ImageResult<()> {
    use std::io::{Seek, SeekFrom};

    let name = image.filename();
    file.seek(SeekFrom::Start(0))
        .map_err(ImageError::io_with(format!("seek \"{}\"", name)))?;
    let header = NativeHeader::read_from(&mut file, &name)?;
    let length = file
        .metadata()
        .map_err(ImageError::io_with(format!("stat \"{}\"", name)))?
        .len();

    let expected = SIZEOF_HEADER as u64 + header.sizeof_image();
    if length < expected {
        return Err(ConstructionError::FileTooShort {
            path: name,
            expected,
            actual: length,
        }
        .into());
    }

    let mut state = image.state_mut();
    state.apply_header(&header);
    state.storage = Storage::FileOpenRead { file, length };
    Ok(())
}

fn build_read(image: &Image, path: &Path, sequential: bool) -> ImageResult<()> {
    let registry = image.registry().clone();
    let name = path.display().to_string();

    match sniff_magic(path)? {
        Some(order) if order.is_host() => {
            let file =
                File::open(path).map_err(ImageError::io_with(format!("open \"{}\"", name)))?;
            open_native(image, file)
        }
        Some(order) => {
            debug!("\"{}\" is {:?}-endian, swapping on read", name, order);
            let source = Image::new_mode(&registry, &name, "v")?;
            image.state_mut().storage = Storage::Lazy(None);
            image.pipeline(DemandStyle::Any, &[&source])?;
            image.state_mut().byte_order = ByteOrder::host();
            image.generate(Arc::new(SwapProducer::new(&source)))
        }
        None => {
            let formats = registry.formats().clone();
            let loader = formats.find_loader(path)?;
            let loaded = formats.load(&registry, loader, path, &LoadOptions { sequential })?;
            image.state_mut().storage = Storage::Lazy(None);
            loaded.write(image)
        }
    }
}

fn build_read_write(image: &Image, path: &Path) -> ImageResult<()> {
    let name = path.display().to_string();
    match sniff_magic(path)? {
        Some(order) if order.is_host() => {}
        Some(_) => return Err(ConstructionError::ForeignByteOrder { path: name }.into()),
        None => return Err(ConstructionError::NotNative { path: name }.into()),
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(ImageError::io_with(format!("open \"{}\" read-write", name)))?;
    open_native(image, file)?;
    image.remap_read_write()
}

fn build_write(image: &Image, path: &Path) -> ImageResult<()> {
    let registry = image.registry().clone();
    let saver = registry.formats().find_saver(path)?;

    {
        let mut state = image.state_mut();
        if saver == SaverId::NATIVE {
            state.storage = Storage::FileOpenWrite { file: None };
        } else {
            debug!("\"{}\" will be saved with {} when written", state.filename, saver);
            state.storage = Storage::Lazy(None);
            state.deferred_save = Some(saver);
        }
    }

    if registry.config().progress_enabled() {
        image.connect(progress_reporter());
        image.set_progress(true);
    }
    Ok(())
}

fn build_raw(image: &Image, path: &Path, guess_interpretation: bool) -> ImageResult<()> {
    let name = path.display().to_string();
    let file = File::open(path).map_err(ImageError::io_with(format!("open \"{}\"", name)))?;
    let length = file
        .metadata()
        .map_err(ImageError::io_with(format!("stat \"{}\"", name)))?
        .len();

    let mut state = image.state_mut();
    state.check_geometry()?;
    if guess_interpretation {
        state.interpretation = Interpretation::guess_from_bands(state.bands);
    }

    let expected = state.header_size + state.sizeof_image();
    if length < expected {
        return Err(ConstructionError::FileTooShort {
            path: name,
            expected,
            actual: length,
        }
        .into());
    }
    if length > expected {
        warn!(
            "\"{}\" is longer than expected: {} bytes, should be {}",
            name, length, expected
        );
    }

    state.byte_order = ByteOrder::host();
    state.storage = Storage::FileOpenRead { file, length };
    Ok(())
}

fn build_foreign(
    image: &Image,
    buffer: Option<ForeignBuffer>,
    claimed: u64,
    guess_interpretation: bool,
) -> ImageResult<()> {
    let mut state = image.state_mut();
    let buffer = buffer.ok_or_else(|| ConstructionError::MissingBuffer {
        mode: state.mode.clone(),
    })?;
    state.check_geometry()?;

    let expected = state.sizeof_image();
    if claimed != 0 && claimed < expected {
        return Err(ConstructionError::BufferTooSmall {
            expected,
            actual: claimed,
        }
        .into());
    }
    let actual = buffer.read().len() as u64;
    if actual < expected {
        return Err(ConstructionError::BufferTooSmall { expected, actual }.into());
    }

    if guess_interpretation {
        state.interpretation = Interpretation::guess_from_bands(state.bands);
    }
    state.storage = Storage::MemoryForeign(buffer);
    Ok(())
}

/// Serves a native file of the other byte order, swapping as it goes.
struct SwapProducer {
    source: Image,
}

impl SwapProducer {
    fn new(source: &Image) -> Self {
        Self {
            source: source.clone(),
        }
    }
}

impl Producer for SwapProducer {
    fn produce(&self, rect: Rect) -> ImageResult<Vec<u8>> {
        let mut pixels = Region::new(&self.source).fetch(rect)?;
        crate::core::header::byteswap(self.source.format(), self.source.coding(), &mut pixels);
        Ok(pixels)
    }

    fn name(&self) -> &str {
        "byteswap"
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Image {
    /// A lazy image with a generated name.
    pub fn new(registry: &Arc<Registry>) -> ImageResult<Image> {
        ImageBuilder::new("p").build(registry)
    }

    /// A lazy or other filename-free image with a given name.
    pub(crate) fn new_named(registry: &Arc<Registry>, name: &str, mode: &str) -> ImageResult<Image> {
        ImageBuilder::new(mode).with_filename(name).build(registry)
    }

    /// A memory image; geometry is set later and the buffer is allocated at
    /// write-prepare.
    pub fn new_memory(registry: &Arc<Registry>) -> ImageResult<Image> {
        ImageBuilder::new("t").build(registry)
    }

    /// Build `filename` in one of the mode strings of [`OpenMode`].
    pub fn new_mode(registry: &Arc<Registry>, filename: &str, mode: &str) -> ImageResult<Image> {
        ImageBuilder::new(mode).with_filename(filename).build(registry)
    }

    /// Open a native or foreign file for reading.
    pub fn new_from_file(registry: &Arc<Registry>, filename: &str) -> ImageResult<Image> {
        Self::new_mode(registry, filename, "r")
    }

    /// Open a native file for in-place editing.
    pub fn new_from_file_rw(registry: &Arc<Registry>, filename: &str) -> ImageResult<Image> {
        Self::new_mode(registry, filename, "rw")
    }

    /// Open a headerless file of host-order pixels.
    pub fn new_from_file_raw(
        registry: &Arc<Registry>,
        filename: &str,
        width: u32,
        height: u32,
        bands: u32,
        offset: u64,
    ) -> ImageResult<Image> {
        ImageBuilder::new("a")
            .with_filename(filename)
            .with_size(width, height, bands)
            .with_header_size(offset)
            .build(registry)
    }

    /// Wrap caller-owned memory. `size` of zero skips the claimed-size check.
    pub fn new_from_memory(
        registry: &Arc<Registry>,
        buffer: ForeignBuffer,
        size: u64,
        width: u32,
        height: u32,
        bands: u32,
        format: BandFormat,
    ) -> ImageResult<Image> {
        ImageBuilder::new("m")
            .with_size(width, height, bands)
            .with_format(format)
            .with_foreign(buffer, size)
            .build(registry)
    }

    /// A one-band double image, ready for writing through
    /// [`with_pixels_mut`](Image::with_pixels_mut).
    pub fn new_matrix(registry: &Arc<Registry>, width: u32, height: u32) -> ImageResult<Image> {
        let image = ImageBuilder::new("t")
            .with_size(width, height, 1)
            .with_format(BandFormat::Double)
            .with_interpretation(Interpretation::Matrix)
            .build(registry)?;
        image.write_prepare()?;
        Ok(image)
    }

    /// A one-band double image holding `values`, row by row.
    pub fn new_matrix_from_array(
        registry: &Arc<Registry>,
        width: u32,
        height: u32,
        values: &[f64],
    ) -> ImageResult<Image> {
        let expected = width as usize * height as usize;
        if values.len() != expected {
            return Err(ConstructionError::BadArrayLength {
                expected,
                actual: values.len(),
            }
            .into());
        }

        let image = Self::new_matrix(registry, width, height)?;
        {
            let mut state = image.state_mut();
            let name = state.filename.clone();
            let data = state.data_mut().ok_or(ModeError::NoData { image: name })?;
            for (chunk, value) in data.chunks_exact_mut(8).zip(values) {
                chunk.copy_from_slice(&value.to_ne_bytes());
            }
        }
        Ok(image)
    }

    /// A native write target in the temp directory, removed on close.
    ///
    /// `template` is a filename in which `%s` is replaced by a unique part,
    /// such as `"%s.v"`.
    pub fn new_temp_file(registry: &Arc<Registry>, template: &str) -> ImageResult<Image> {
        let (before, after) = template.split_once("%s").unwrap_or(("", template));
        let prefix = format!("{}rasterkit-", before);
        let dir = registry.config().temp_dir();

        let temp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(after)
            .tempfile_in(&dir)
            .map_err(ImageError::io_with(format!("create temp file in \"{}\"", dir.display())))?;
        let path = temp
            .into_temp_path()
            .keep()
            .map_err(|e| ImageError::io("keep temp file", e.error))?;
        let name = path.display().to_string();

        let image = match Self::new_mode(registry, &name, "w") {
            Ok(image) => image,
            Err(e) => {
                // Nothing owns the file yet.
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
        };
        image.set_delete_on_close(true);
        Ok(image)
    }

    /// Map a readable native file read-write.
    pub(crate) fn remap_read_write(&self) -> ImageResult<()> {
        let name = self.filename();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&name)
            .map_err(ImageError::io_with(format!("open \"{}\" read-write", name)))?;

        // SAFETY: the map is only reached through this image's state lock, and
        // files are expected not to be truncated by other processes while
        // mapped.
        let map = unsafe { MmapOptions::new().map_mut(&file) }
            .map_err(ImageError::io_with(format!("map \"{}\" read-write", name)))?;

        let old = {
            let mut state = self.state_mut();
            let needed = (state.header_size + state.sizeof_image()) as usize;
            if map.len() < needed {
                return Err(ConstructionError::FileTooShort {
                    path: name,
                    expected: needed as u64,
                    actual: map.len() as u64,
                }
                .into());
            }
            std::mem::replace(&mut state.storage, Storage::MappedReadWrite { map })
        };
        drop(old);
        debug!("\"{}\" mapped read-write", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CoreConfig;
    use crate::core::types::StorageMode;
    use parking_lot::RwLock;

    fn registry() -> Arc<Registry> {
        Registry::new(CoreConfig::default())
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!(OpenMode::parse("rs").unwrap(), OpenMode::ReadSequential);
        assert_eq!(OpenMode::parse("v").unwrap(), OpenMode::Native);
        assert!(matches!(
            OpenMode::parse("x"),
            Err(ConstructionError::BadMode { .. })
        ));
        assert!(OpenMode::parse("").is_err());
    }

    #[test]
    fn test_bad_mode_leaks_nothing() {
        let registry = registry();
        let err = Image::new_mode(&registry, "fred.v", "q").unwrap_err();
        assert!(err.to_string().contains("bad mode"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_header_too_large() {
        let registry = registry();
        let err = ImageBuilder::new("a")
            .with_filename("fred.raw")
            .with_size(1, 1, 1)
            .with_header_size(MAX_HEADER_SIZE + 1)
            .build(&registry)
            .unwrap_err();
        assert!(matches!(
            err,
            ImageError::Construction(ConstructionError::HeaderTooLarge { .. })
        ));
    }

    #[test]
    fn test_missing_filename() {
        let registry = registry();
        assert!(ImageBuilder::new("r").build(&registry).is_err());
    }

    #[test]
    fn test_simple_modes() {
        let registry = registry();
        let lazy = Image::new(&registry).unwrap();
        assert_eq!(lazy.mode(), StorageMode::Lazy);
        assert!(lazy.filename().starts_with("temp-"));

        let memory = Image::new_memory(&registry).unwrap();
        assert_eq!(memory.mode(), StorageMode::MemoryOwned);
        assert!(!memory.has_data());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_foreign_memory() {
        let registry = registry();
        let buffer: ForeignBuffer = Arc::new(RwLock::new(vec![7u8; 12]));

        let image =
            Image::new_from_memory(&registry, buffer.clone(), 12, 2, 2, 3, BandFormat::UChar)
                .unwrap();
        assert_eq!(image.mode(), StorageMode::MemoryForeign);
        assert_eq!(image.interpretation(), Interpretation::Srgb);
        assert_eq!(&*image.pixels().unwrap(), &[7u8; 12][..]);

        // The caller still owns the buffer after the image is gone.
        drop(image);
        assert_eq!(buffer.read().len(), 12);

        let claimed = Image::new_from_memory(&registry, buffer.clone(), 5, 2, 2, 3, BandFormat::UChar);
        assert!(claimed.is_err());
        let actual = Image::new_from_memory(&registry, buffer, 0, 4, 4, 3, BandFormat::UChar);
        assert!(actual.is_err());
    }

    #[test]
    fn test_matrix() {
        let registry = registry();
        let matrix = Image::new_matrix_from_array(&registry, 2, 2, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(matrix.format(), BandFormat::Double);
        let pixels = matrix.pixels().unwrap();
        let third = f64::from_ne_bytes(pixels[16..24].try_into().unwrap());
        assert_eq!(third, 3.0);
        drop(pixels);

        let err = Image::new_matrix_from_array(&registry, 2, 2, &[1.0]).unwrap_err();
        assert!(matches!(
            err,
            ImageError::Construction(ConstructionError::BadArrayLength {
                expected: 4,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_raw_file() {
        let registry = registry();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pixels.raw");
        let mut contents = vec![0xffu8; 10];
        contents.extend(0..12u8);
        std::fs::write(&path, &contents).unwrap();
        let name = path.to_str().unwrap();

        let image = Image::new_from_file_raw(&registry, name, 4, 3, 1, 10).unwrap();
        assert_eq!(image.mode(), StorageMode::FileOpenRead);
        assert_eq!(image.interpretation(), Interpretation::BW);
        assert_eq!(&*image.pixels().unwrap(), &(0..12u8).collect::<Vec<_>>()[..]);

        // Longer than needed is only a warning.
        assert!(Image::new_from_file_raw(&registry, name, 2, 2, 1, 0).is_ok());

        let err = Image::new_from_file_raw(&registry, name, 5, 5, 1, 10).unwrap_err();
        assert!(matches!(
            err,
            ImageError::Construction(ConstructionError::FileTooShort { .. })
        ));
    }

    #[test]
    fn test_temp_file_removed_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(CoreConfig::default().with_temp_dir(dir.path()));

        let image = Image::new_temp_file(&registry, "%s.v").unwrap();
        let path = image.delete_on_close().unwrap();
        assert!(path.exists());
        assert!(path.to_str().unwrap().ends_with(".v"));
        assert_eq!(image.mode(), StorageMode::FileOpenWrite);

        drop(image);
        assert!(!path.exists());
    }
}
