//! Mode transitions.
//!
//! Each access contract has one entry point that either confirms the current
//! storage satisfies it or converts the storage until it does:
//!
//! | contract            | entry point        |
//! |---------------------|--------------------|
//! | flat read           | [`Image::wio_input`]  |
//! | region read         | [`Image::pio_input`]  |
//! | flat / line write   | [`Image::wio_output`] |
//! | region write        | [`Image::pio_output`] |
//! | flat read-write     | [`Image::inplace`]    |
//!
//! A failed transition leaves the storage as it was.

use crate::core::descriptor::Lifecycle;
use crate::core::error::{ConstructionError, ExecutionError, ImageError, ImageResult, ModeError};
use crate::core::header::SIZEOF_HEADER;
use crate::core::storage::Storage;
use crate::core::types::StorageMode;
use crate::execution::build::open_native;
use crate::execution::image::Image;
use log::{debug, warn};
use memmap2::Mmap;
use std::fs::OpenOptions;

impl Image {
    fn no_data(&self) -> ImageError {
        ModeError::NoData {
            image: self.filename(),
        }
        .into()
    }

    fn not_readable(&self, mode: StorageMode) -> ImageError {
        ModeError::NotReadable {
            image: self.filename(),
            mode,
        }
        .into()
    }

    fn not_writable(&self, mode: StorageMode) -> ImageError {
        ModeError::NotWritable {
            image: self.filename(),
            mode,
        }
        .into()
    }

    // ========================================================================
    // Read contracts
    // ========================================================================

    /// Make the whole image addressable as one flat array.
    pub fn wio_input(&self) -> ImageResult<()> {
        self.state().check_live("read")?;
        let (mode, has_data) = {
            let state = self.state();
            (state.storage.mode(), state.storage.has_data())
        };

        match mode {
            StorageMode::MemoryOwned | StorageMode::MemoryForeign => {
                if has_data {
                    Ok(())
                } else {
                    Err(self.no_data())
                }
            }
            StorageMode::MappedRead | StorageMode::MappedReadWrite => Ok(()),
            StorageMode::Lazy => self.materialize(),
            StorageMode::FileOpenRead => self.map_input(),
            StorageMode::FileOpenWrite => {
                self.rewind_output()?;
                self.wio_input()
            }
            StorageMode::None => Err(self.not_readable(mode)),
        }
    }

    /// Make the image readable through regions.
    pub fn pio_input(&self) -> ImageResult<()> {
        self.state().check_live("read")?;
        let (mode, has_data, has_producer) = {
            let state = self.state();
            (
                state.storage.mode(),
                state.storage.has_data(),
                state.storage.producer().is_some(),
            )
        };

        match mode {
            StorageMode::MemoryOwned | StorageMode::MemoryForeign if !has_data => {
                Err(self.no_data())
            }
            StorageMode::MemoryOwned
            | StorageMode::MemoryForeign
            | StorageMode::MappedRead
            | StorageMode::MappedReadWrite
            | StorageMode::FileOpenRead => Ok(()),
            StorageMode::Lazy if has_producer => Ok(()),
            StorageMode::Lazy => Err(self.no_data()),
            StorageMode::FileOpenWrite => self.rewind_output(),
            StorageMode::None => Err(self.not_readable(mode)),
        }
    }

    /// Compute a lazy image into memory and adopt the buffer.
    fn materialize(&self) -> ImageResult<()> {
        if self.state().storage.producer().is_none() {
            return Err(self.no_data());
        }
        let regions = self.registry().region_count(self.id());
        if regions > 0 {
            warn!(
                "\"{}\" materialized while {} regions are reading it",
                self.filename(),
                regions
            );
        }

        debug!("materializing \"{}\"", self.filename());
        let buffer = self.write_to_memory()?;
        let old = {
            let mut state = self.state_mut();
            std::mem::replace(&mut state.storage, Storage::MemoryOwned(Some(buffer)))
        };
        // The producer may hold the last handle on other images.
        drop(old);
        Ok(())
    }

    /// Map the whole of an open file and switch to `MappedRead`.
    fn map_input(&self) -> ImageResult<()> {
        let old = {
            let mut state = self.state_mut();
            let Storage::FileOpenRead { file, .. } = &state.storage else {
                return Ok(());
            };

            // SAFETY: the map is only reached through this image's state lock,
            // and files are expected not to be truncated while mapped.
            let map = unsafe { Mmap::map(file) }
                .map_err(ImageError::io_with(format!("map \"{}\"", state.filename)))?;

            let needed = state.header_size + state.sizeof_image();
            if (map.len() as u64) < needed {
                return Err(ConstructionError::FileTooShort {
                    path: state.filename.clone(),
                    expected: needed,
                    actual: map.len() as u64,
                }
                .into());
            }
            debug!("mapped \"{}\", {} bytes", state.filename, map.len());
            std::mem::replace(&mut state.storage, Storage::MappedRead { map })
        };
        drop(old);
        Ok(())
    }

    // ========================================================================
    // Write contracts
    // ========================================================================

    /// Check the image can take a flat or line-by-line write.
    ///
    /// An unattached lazy image becomes a memory image.
    pub fn wio_output(&self) -> ImageResult<()> {
        let mut state = self.state_mut();
        state.check_live("write")?;
        match &state.storage {
            Storage::Lazy(Some(_)) => Err(ModeError::AlreadyWritten {
                image: state.filename.clone(),
            }
            .into()),
            Storage::Lazy(None) => {
                debug!("\"{}\": lazy image turned to memory for writing", state.filename);
                state.storage = Storage::MemoryOwned(None);
                Ok(())
            }
            Storage::MemoryOwned(_) | Storage::MemoryForeign(_) | Storage::FileOpenWrite { .. } => {
                Ok(())
            }
            other => Err(ModeError::NotWritable {
                image: state.filename.clone(),
                mode: other.mode(),
            }
            .into()),
        }
    }

    /// Check a producer can be attached or a sink run into this image.
    pub fn pio_output(&self) -> ImageResult<()> {
        let state = self.state();
        state.check_live("write")?;
        let written = || -> ImageError {
            ModeError::AlreadyWritten {
                image: state.filename.clone(),
            }
            .into()
        };
        match &state.storage {
            Storage::MemoryOwned(Some(_)) | Storage::Lazy(Some(_)) => Err(written()),
            Storage::MemoryOwned(None)
            | Storage::Lazy(None)
            | Storage::FileOpenWrite { .. }
            | Storage::MemoryForeign(_) => Ok(()),
            other => Err(ModeError::NotWritable {
                image: state.filename.clone(),
                mode: other.mode(),
            }
            .into()),
        }
    }

    /// Get storage ready for the first write.
    ///
    /// Allocates the buffer of a memory image or creates the file of a native
    /// write target and writes its header.
    pub fn write_prepare(&self) -> ImageResult<()> {
        let fallback = self.registry().config().lazy_write_fallback;
        let mut state = self.state_mut();
        state.check_live("write")?;
        state.check_geometry()?;
        if !state.coding.is_legal(state.format, state.bands) {
            return Err(ConstructionError::BadCoding {
                format: state.format,
                coding: state.coding,
                bands: state.bands,
            }
            .into());
        }

        if matches!(state.storage, Storage::Lazy(None)) {
            if !fallback {
                return Err(ModeError::BadDescriptor {
                    image: state.filename.clone(),
                    mode: StorageMode::Lazy,
                }
                .into());
            }
            debug!("write_prepare: old-style output for \"{}\"", state.filename);
            state.storage = Storage::MemoryOwned(None);
        }

        let size = state.sizeof_image();
        let name = state.filename.clone();
        let header = state.native_header();
        match &mut state.storage {
            Storage::MappedReadWrite { .. } => Ok(()),
            // Geometry may have changed since the buffer was attached.
            Storage::MemoryForeign(buffer) => {
                let actual = buffer.read().len() as u64;
                if actual < size {
                    return Err(ConstructionError::BufferTooSmall {
                        expected: size,
                        actual,
                    }
                    .into());
                }
                Ok(())
            }
            Storage::MemoryOwned(Some(_)) => Ok(()),
            Storage::MemoryOwned(buffer @ None) => {
                let mut data = Vec::new();
                data.try_reserve_exact(size as usize)
                    .map_err(|_| ConstructionError::OutOfMemory { bytes: size })?;
                data.resize(size as usize, 0);
                *buffer = Some(data);
                Ok(())
            }
            Storage::FileOpenWrite { file: Some(_) } => Ok(()),
            Storage::FileOpenWrite { file } => {
                let mut handle = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&name)
                    .map_err(ImageError::io_with(format!("create \"{}\"", name)))?;
                header.write_to(&mut handle, &name)?;
                debug!("opened \"{}\" for writing", name);
                *file = Some(handle);
                Ok(())
            }
            other => Err(ModeError::BadDescriptor {
                image: name,
                mode: other.mode(),
            }
            .into()),
        }
    }

    /// Turn a finished native write target into a readable file.
    ///
    /// The open handle is kept across the reset and reused, so the file never
    /// has to be reopened by name. A delete-on-close file is unlinked once the
    /// handle is a plain read handle.
    pub(crate) fn rewind_output(&self) -> ImageResult<()> {
        let rewind_failed = |name: String, e: &dyn std::fmt::Display| -> ImageError {
            ExecutionError::RewindFailed {
                image: name,
                message: e.to_string(),
            }
            .into()
        };

        let name = self.filename();
        let regions = self.registry().region_count(self.id());
        if regions > 0 {
            warn!("rewinding \"{}\" with {} active regions", name, regions);
        }

        let file = {
            let mut state = self.state_mut();
            let file = match &mut state.storage {
                Storage::FileOpenWrite { file } => file.take(),
                other => {
                    return Err(not_rewindable(&name, other.mode()));
                }
            };
            let Some(file) = file else {
                return Err(rewind_failed(name, &"nothing was written"));
            };
            state.dispose();
            file
        };

        debug!("rewinding \"{}\" for reading", name);
        let length = file
            .metadata()
            .map_err(|e| rewind_failed(name.clone(), &e))?
            .len();
        if length < SIZEOF_HEADER as u64 {
            return Err(rewind_failed(name, &"file has no header"));
        }

        // A failed reopen leaves the descriptor disposed.
        open_native(self, file).map_err(|e| rewind_failed(name.clone(), &e))?;
        {
            let mut state = self.state_mut();
            state.mode = "v".to_string();
            state.lifecycle = Lifecycle::Live;
        }

        let doomed = self.state_mut().delete_on_close.take();
        if let Some(path) = doomed {
            debug!("unlinking \"{}\" after rewind", path.display());
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("unable to unlink \"{}\": {}", path.display(), e);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Read-write
    // ========================================================================

    /// Flat read access, plus write access to the same pixels.
    pub(crate) fn make_writable(&self) -> ImageResult<()> {
        self.wio_input()?;
        if self.mode() == StorageMode::MappedRead {
            self.remap_read_write()?;
        }
        Ok(())
    }

    /// Get ready for an in-place edit. Everything downstream is invalidated.
    pub fn inplace(&self) -> ImageResult<()> {
        self.make_writable()?;
        self.invalidate_all();
        Ok(())
    }
}

fn not_rewindable(name: &str, mode: StorageMode) -> ImageError {
    ModeError::NotReadable {
        image: name.to_string(),
        mode,
    }
    .into()
}
