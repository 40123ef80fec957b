//! The write pipeline.
//!
//! Pixels get into an image in one of two ways:
//!
//! - pull: [`Image::generate`] attaches a [`Producer`]. A lazy target keeps
//!   it and computes on demand; a memory or file target is filled right away
//!   by a sink walking it in strips.
//! - push: [`Image::write_line`] takes one scanline at a time, top to bottom.
//!
//! Both report progress on the pipeline's signalling image and poll the kill
//! flag after every unit of work.

use crate::core::error::{ExecutionError, ImageError, ImageResult, ModeError};
use crate::core::storage::{Producer, Storage};
use crate::core::types::{DemandStyle, Rect, StorageMode, TileIterator};
use crate::execution::format::SaveOptions;
use crate::execution::image::Image;
use crate::execution::progress::{Progress, ProgressSnapshot};
use crate::execution::region::Region;
use crate::graph::events::ImageEvent;
use log::{debug, warn};
use rayon::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Copies pixels out of another image, region by region.
///
/// Holds a handle on the source, so the source lives at least as long as the
/// image this producer is attached to.
struct CopyProducer {
    source: Image,
}

impl Producer for CopyProducer {
    fn produce(&self, rect: Rect) -> ImageResult<Vec<u8>> {
        Region::new(&self.source).fetch(rect)
    }

    fn name(&self) -> &str {
        "copy"
    }
}

impl Image {
    // ========================================================================
    // Wiring
    // ========================================================================

    /// Make this image the output of an operation reading `inputs`.
    ///
    /// Header fields are copied from the first input, the demand hint becomes
    /// the most restrictive of `hint` and the inputs' hints, every input is
    /// linked upstream of this image, and a progress signaller is inherited.
    pub fn pipeline(&self, hint: DemandStyle, inputs: &[&Image]) -> ImageResult<()> {
        if inputs.iter().any(|input| input.ptr_eq(self)) {
            return Err(ImageError::evaluation(
                &self.filename(),
                "an image cannot be its own input",
            ));
        }

        if let Some(first) = inputs.first() {
            let mut fields = crate::core::descriptor::Descriptor::new("", "");
            fields.copy_fields(&first.state());
            self.state_mut().copy_fields(&fields);
        }

        let demand = inputs
            .iter()
            .fold(hint, |demand, input| demand.most_restrictive(input.demand()));
        self.set_demand_hint(demand);

        for input in inputs {
            self.registry().link(input.id(), self.id());
            self.inherit_progress_signal(input);
        }
        Ok(())
    }

    /// Attach `producer` as the source of this image's pixels.
    ///
    /// A lazy image keeps the producer; memory and native file targets are
    /// computed now. Attaching a second producer to the same image fails and
    /// leaves the first in place.
    pub fn generate(&self, producer: Arc<dyn Producer>) -> ImageResult<()> {
        self.pio_output()?;

        let mode = self.mode();
        match mode {
            StorageMode::Lazy => {
                {
                    let mut state = self.state_mut();
                    match &mut state.storage {
                        Storage::Lazy(slot @ None) => *slot = Some(producer),
                        _ => {
                            return Err(ModeError::AlreadyWritten {
                                image: state.filename.clone(),
                            }
                            .into())
                        }
                    }
                }
                self.written()
            }
            StorageMode::MemoryOwned | StorageMode::MemoryForeign | StorageMode::FileOpenWrite => {
                self.sink(producer)
            }
            other => Err(ModeError::NotWritable {
                image: self.filename(),
                mode: other,
            }
            .into()),
        }
    }

    /// Copy this image into `out` through regions.
    ///
    /// `out` is checked before it is wired up, so a refused write leaves it
    /// untouched.
    pub fn write(&self, out: &Image) -> ImageResult<()> {
        self.pio_input()?;
        out.pio_output()?;
        out.pipeline(DemandStyle::ThinStrip, &[self])?;
        out.generate(Arc::new(CopyProducer {
            source: self.clone(),
        }))
    }

    /// Compute the whole image into a new buffer owned by the caller.
    pub fn write_to_memory(&self) -> ImageResult<Vec<u8>> {
        let temp = Image::new_memory(self.registry())?;
        self.write(&temp)?;
        temp.take_buffer()
    }

    /// Save to `path`, natively or through the format layer.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> ImageResult<()> {
        let path = path.as_ref();
        let formats = self.registry().formats().clone();
        let saver = formats.find_saver(path)?;
        debug!("writing \"{}\" to \"{}\" with {}", self.filename(), path.display(), saver);
        formats.save(saver, self, path, &SaveOptions::default())
    }

    // ========================================================================
    // Sink
    // ========================================================================

    fn sink(&self, producer: Arc<dyn Producer>) -> ImageResult<()> {
        self.write_prepare()?;
        self.set_kill(false);
        self.preeval();

        let result = self.sink_strips(producer.as_ref());
        self.posteval();
        result?;

        self.minimise_all();
        self.written()
    }

    fn sink_strips(&self, producer: &dyn Producer) -> ImageResult<()> {
        let config = self.registry().config();
        let (width, height, line, to_file) = {
            let state = self.state();
            (
                state.width,
                state.height,
                state.sizeof_line(),
                state.storage.mode() == StorageMode::FileOpenWrite,
            )
        };
        let strips: Vec<Rect> = TileIterator::strips(width, height, config.tile_height).collect();
        debug!(
            "sink: {} strips of \"{}\" from {}",
            strips.len(),
            self.filename(),
            producer.name()
        );

        let processed = AtomicU64::new(0);
        let unit = |strip: &Rect| -> ImageResult<()> {
            let pixels = producer.produce(*strip)?;
            let expected = strip.height as usize * line;
            if pixels.len() != expected {
                return Err(ImageError::evaluation(
                    &self.filename(),
                    format!(
                        "{} produced {} bytes for {:?}, expected {}",
                        producer.name(),
                        pixels.len(),
                        strip,
                        expected
                    ),
                ));
            }
            self.store_rows(strip.top, &pixels)?;
            let done = processed.fetch_add(strip.area(), Ordering::SeqCst) + strip.area();
            self.eval(done);
            self.check_kill()
        };

        // Files are appended to, so strips must arrive in order.
        if config.parallel && !to_file {
            strips.par_iter().try_for_each(unit)
        } else {
            strips.iter().try_for_each(unit)
        }
    }

    /// Store whole rows starting at line `top`. File targets append.
    fn store_rows(&self, top: u32, rows: &[u8]) -> ImageResult<()> {
        let mut state = self.state_mut();
        let offset = top as usize * state.sizeof_line();
        let name = state.filename.clone();

        match &mut state.storage {
            Storage::MemoryForeign(buffer) => {
                let buffer = buffer.clone();
                drop(state);
                let mut guard = buffer.write();
                let target = guard
                    .get_mut(offset..offset + rows.len())
                    .ok_or(ModeError::NoData { image: name })?;
                target.copy_from_slice(rows);
                Ok(())
            }
            Storage::FileOpenWrite { file: Some(file) } => file
                .write_all(rows)
                .map_err(ImageError::io_with(format!("write to \"{}\"", name))),
            _ => {
                let target = state
                    .data_mut()
                    .and_then(|data| data.get_mut(offset..offset + rows.len()))
                    .ok_or(ModeError::NoData { image: name })?;
                target.copy_from_slice(rows);
                Ok(())
            }
        }
    }

    // ========================================================================
    // Line-by-line
    // ========================================================================

    /// Write scanline `y`. Lines must arrive in order from 0.
    ///
    /// Line 0 prepares the image and starts evaluation; the last line ends it
    /// and marks the image written.
    pub fn write_line(&self, y: u32, line: &[u8]) -> ImageResult<()> {
        if y == 0 {
            self.wio_output()?;
            let rewritten = matches!(self.state().storage, Storage::MemoryOwned(Some(_)));
            if rewritten {
                warn!("\"{}\" is being written a second time", self.filename());
            }
            self.set_kill(false);
            self.write_prepare()?;
            self.preeval();
        }

        let (width, height, size, name) = {
            let state = self.state();
            (
                state.width,
                state.height,
                state.sizeof_line(),
                state.filename.clone(),
            )
        };
        if y >= height {
            return Err(ModeError::LineOutOfRange {
                image: name,
                y,
                height,
            }
            .into());
        }
        if line.len() < size {
            return Err(ModeError::LineTooShort {
                image: name,
                expected: size,
                actual: line.len(),
            }
            .into());
        }

        self.store_rows(y, &line[..size])?;
        self.eval((y as u64 + 1) * width as u64);
        self.check_kill()?;

        if y == height - 1 {
            self.posteval();
            self.written()?;
        }
        Ok(())
    }

    // ========================================================================
    // Progress and completion
    // ========================================================================

    /// Update the progress record of this evaluation and report it.
    ///
    /// The record lives on the pipeline's signalling image, or on this image
    /// when there is none. Only a signalling image gets events.
    fn report_progress(
        &self,
        update: impl FnOnce(&mut Progress),
        event: fn(ProgressSnapshot) -> ImageEvent,
    ) {
        let signal = self.progress_signal();
        let owner = signal.as_ref().unwrap_or(self);
        let (name, width, height) = {
            let state = self.state();
            (state.filename.clone(), state.width, state.height)
        };
        let snapshot = owner.with_progress(|progress| {
            update(progress);
            progress.snapshot(&name, width, height)
        });
        if let Some(signal) = &signal {
            signal.emit(&event(snapshot));
        }
    }

    pub(crate) fn preeval(&self) {
        let total = self.n_pels();
        self.report_progress(|progress| progress.reset(total), ImageEvent::PreEval);
    }

    pub(crate) fn eval(&self, processed: u64) {
        // Parallel strips may finish out of order.
        self.report_progress(
            |progress| progress.update(processed.max(progress.processed())),
            ImageEvent::Eval,
        );
    }

    pub(crate) fn posteval(&self) {
        self.report_progress(|_| {}, ImageEvent::PostEval);
    }

    /// Mark the image finished: notify listeners, flush a native target and
    /// run a deferred save.
    pub(crate) fn written(&self) -> ImageResult<()> {
        self.emit(&ImageEvent::Written);

        let name = self.filename();
        {
            let mut state = self.state_mut();
            if let Storage::FileOpenWrite { file: Some(file) } = &mut state.storage {
                file.flush()
                    .map_err(ImageError::io_with(format!("flush \"{}\"", name)))?;
            }
        }

        let saver = self.state_mut().deferred_save.take();
        if let Some(saver) = saver {
            let path = PathBuf::from(&name);
            debug!("running deferred {} save of \"{}\"", saver, name);
            let formats = self.registry().formats().clone();
            formats
                .save(saver, self, &path, &SaveOptions::default())
                .map_err(|e| ExecutionError::Save {
                    image: name.clone(),
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CoreConfig;
    use crate::core::types::BandFormat;
    use crate::graph::registry::Registry;
    use parking_lot::Mutex;

    fn registry() -> Arc<Registry> {
        Registry::new(CoreConfig::default().with_tile_height(2))
    }

    struct Ramp;

    impl Producer for Ramp {
        fn produce(&self, rect: Rect) -> ImageResult<Vec<u8>> {
            let mut out = Vec::new();
            for y in rect.top..rect.bottom() {
                for x in rect.left..rect.right() {
                    out.push((y * 10 + x) as u8);
                }
            }
            Ok(out)
        }
    }

    fn lazy_ramp(registry: &Arc<Registry>, width: u32, height: u32) -> Image {
        let image = Image::new(registry).unwrap();
        {
            let mut state = image.state_mut();
            state.width = width;
            state.height = height;
            state.bands = 1;
            state.format = BandFormat::UChar;
        }
        image.generate(Arc::new(Ramp)).unwrap();
        image
    }

    #[test]
    fn test_lazy_generate_twice_fails() {
        let registry = registry();
        let image = lazy_ramp(&registry, 3, 3);
        let err = image.generate(Arc::new(Ramp)).unwrap_err();
        assert!(err.to_string().contains("already written"));
        assert!(image.state().storage.producer().is_some());
        assert_eq!(image.write_to_memory().unwrap()[4], 11);
    }

    #[test]
    fn test_write_links_and_copies() {
        let registry = registry();
        let source = lazy_ramp(&registry, 4, 5);
        let out = Image::new_memory(&registry).unwrap();
        source.write(&out).unwrap();

        assert_eq!(out.upstream(), vec![source.id()]);
        assert_eq!(out.demand(), DemandStyle::ThinStrip);
        assert_eq!(out.width(), 4);
        let pixels = out.pixels().unwrap();
        assert_eq!(pixels[..4].to_vec(), vec![0, 1, 2, 3]);
        assert_eq!(pixels[16..].to_vec(), vec![40, 41, 42, 43]);
    }

    #[test]
    fn test_sink_events() {
        let registry = registry();
        let source = lazy_ramp(&registry, 2, 5);
        let out = Image::new_memory(&registry).unwrap();
        out.set_progress(true);
        let events = out.subscribe();

        source.write(&out).unwrap();
        let kinds: Vec<&str> = events.try_iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.first(), Some(&"preeval"));
        assert_eq!(kinds.iter().filter(|k| **k == "eval").count(), 3);
        assert!(kinds.contains(&"posteval"));
        assert!(kinds.contains(&"minimise"));
        assert_eq!(kinds.last(), Some(&"written"));
        assert_eq!(out.progress_snapshot().percent, 100);
    }

    #[test]
    fn test_write_line() {
        let registry = registry();
        let image = Image::new_memory(&registry).unwrap();
        image.init_fields(
            3,
            2,
            1,
            BandFormat::UChar,
            Default::default(),
            Default::default(),
            1.0,
            1.0,
        );
        let written = Arc::new(Mutex::new(0));
        let counter = written.clone();
        image.connect(move |event| {
            if let ImageEvent::Written = event {
                *counter.lock() += 1;
            }
        });

        image.write_line(0, &[1, 2, 3]).unwrap();
        assert!(image.write_line(1, &[4, 5]).is_err());
        image.write_line(1, &[4, 5, 6, 7]).unwrap();
        assert!(image.write_line(2, &[0, 0, 0]).is_err());

        assert_eq!(*written.lock(), 1);
        assert_eq!(image.pixels().unwrap().to_vec(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_kill_stops_write_line() {
        let registry = registry();
        let image = Image::new_memory(&registry).unwrap();
        image.init_fields(
            2,
            4,
            1,
            BandFormat::UChar,
            Default::default(),
            Default::default(),
            1.0,
            1.0,
        );
        image.write_line(0, &[0, 0]).unwrap();
        image.set_kill(true);
        let err = image.write_line(1, &[0, 0]).unwrap_err();
        assert!(err.is_kill());
        assert!(!image.is_killed());
    }

    #[test]
    fn test_short_producer_is_an_error() {
        struct Short;
        impl Producer for Short {
            fn produce(&self, _rect: Rect) -> ImageResult<Vec<u8>> {
                Ok(vec![0])
            }
        }

        let registry = registry();
        let out = Image::new_memory(&registry).unwrap();
        out.init_fields(
            4,
            4,
            1,
            BandFormat::UChar,
            Default::default(),
            Default::default(),
            1.0,
            1.0,
        );
        let err = out.generate(Arc::new(Short)).unwrap_err();
        assert!(err.to_string().contains("produced 1 bytes"));
    }
}
