//! The shared image handle.
//!
//! An [`Image`] is a cheap, cloneable handle to one descriptor. The descriptor
//! is torn down (dispose, then finalize, then removal from the registry) when
//! the last handle goes away.

use crate::core::descriptor::{Descriptor, Lifecycle};
use crate::core::error::{ExecutionError, ImageId, ImageResult, ModeError};
use crate::core::header::ByteOrder;
use crate::core::storage::Storage;
use crate::core::types::{BandFormat, Coding, DemandStyle, Interpretation, StorageMode};
use crate::execution::progress::{Progress, ProgressSnapshot};
use crate::graph::events::{ImageEvent, ListenerId, Listeners};
use crate::graph::registry::{Direction, Registry};
use crossbeam::channel::Receiver;
use log::{debug, warn};
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{
    MappedRwLockReadGuard, Mutex, RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub(crate) struct ImageInner {
    pub(crate) id: ImageId,
    pub(crate) registry: Arc<Registry>,
    pub(crate) state: RwLock<Descriptor>,
    kill: AtomicBool,
    listeners: Listeners,
    progress: Mutex<Progress>,
    /// Image that receives this one's progress events.
    progress_signal: Mutex<Option<Weak<ImageInner>>>,
}

/// Handle to one image.
#[derive(Clone)]
pub struct Image {
    pub(crate) inner: Arc<ImageInner>,
}

/// Read access to the flat pixel array of an image.
///
/// Holds a read lock for as long as it lives, so drop it before asking the
/// same image for anything that changes its mode.
pub enum Pixels<'a> {
    Local(MappedRwLockReadGuard<'a, [u8]>),
    Foreign {
        guard: ArcRwLockReadGuard<RawRwLock, Vec<u8>>,
        len: usize,
    },
}

impl Deref for Pixels<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Pixels::Local(guard) => guard,
            Pixels::Foreign { guard, len } => guard.get(..*len).unwrap_or_default(),
        }
    }
}

impl Image {
    /// A new unused image registered with `registry`.
    pub(crate) fn blank(registry: &Arc<Registry>, filename: &str, mode: &str) -> Self {
        let id = ImageId::new();
        let inner = Arc::new(ImageInner {
            id,
            registry: registry.clone(),
            state: RwLock::new(Descriptor::new(filename, mode)),
            kill: AtomicBool::new(false),
            listeners: Listeners::new(),
            progress: Mutex::new(Progress::default()),
            progress_signal: Mutex::new(None),
        });
        registry.register(id, Arc::downgrade(&inner));
        debug!("new image {} \"{}\" mode \"{}\"", id, filename, mode);
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<ImageInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn state(&self) -> RwLockReadGuard<'_, Descriptor> {
        self.inner.state.read()
    }

    pub(crate) fn state_mut(&self) -> RwLockWriteGuard<'_, Descriptor> {
        self.inner.state.write()
    }

    pub fn id(&self) -> ImageId {
        self.inner.id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// Whether two handles point at the same image.
    pub fn ptr_eq(&self, other: &Image) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ========================================================================
    // Header fields
    // ========================================================================

    pub fn filename(&self) -> String {
        self.state().filename.clone()
    }

    pub fn width(&self) -> u32 {
        self.state().width
    }

    pub fn height(&self) -> u32 {
        self.state().height
    }

    pub fn bands(&self) -> u32 {
        self.state().bands
    }

    pub fn format(&self) -> BandFormat {
        self.state().format
    }

    pub fn coding(&self) -> Coding {
        self.state().coding
    }

    pub fn interpretation(&self) -> Interpretation {
        self.state().interpretation
    }

    pub fn xres(&self) -> f64 {
        self.state().xres
    }

    pub fn yres(&self) -> f64 {
        self.state().yres
    }

    pub fn xoffset(&self) -> i32 {
        self.state().xoffset
    }

    pub fn yoffset(&self) -> i32 {
        self.state().yoffset
    }

    pub fn demand(&self) -> DemandStyle {
        self.state().demand
    }

    /// The storage mode currently backing this image.
    pub fn mode(&self) -> StorageMode {
        self.state().storage.mode()
    }

    /// The mode string this image was built with.
    pub fn mode_string(&self) -> String {
        self.state().mode.clone()
    }

    pub fn header_size(&self) -> u64 {
        self.state().header_size
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.state().byte_order
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state().lifecycle
    }

    pub fn sizeof_pel(&self) -> usize {
        self.state().sizeof_pel()
    }

    pub fn sizeof_line(&self) -> usize {
        self.state().sizeof_line()
    }

    pub fn sizeof_image(&self) -> u64 {
        self.state().sizeof_image()
    }

    pub fn n_pels(&self) -> u64 {
        self.state().n_pels()
    }

    /// Backed by a file in some way.
    pub fn is_file(&self) -> bool {
        self.mode().is_file()
    }

    /// Computed on demand.
    pub fn is_partial(&self) -> bool {
        self.mode() == StorageMode::Lazy
    }

    /// Whether the image has an addressable pixel array right now.
    pub fn has_data(&self) -> bool {
        self.state().storage.has_data()
    }

    /// Set the main header fields in one go.
    #[allow(clippy::too_many_arguments)]
    pub fn init_fields(
        &self,
        width: u32,
        height: u32,
        bands: u32,
        format: BandFormat,
        coding: Coding,
        interpretation: Interpretation,
        xres: f64,
        yres: f64,
    ) {
        let mut state = self.state_mut();
        state.width = width;
        state.height = height;
        state.bands = bands;
        state.format = format;
        state.coding = coding;
        state.interpretation = interpretation;
        state.xres = xres;
        state.yres = yres;
    }

    pub fn set_interpretation(&self, interpretation: Interpretation) {
        self.state_mut().interpretation = interpretation;
    }

    pub fn set_resolution(&self, xres: f64, yres: f64) {
        let mut state = self.state_mut();
        state.xres = xres;
        state.yres = yres;
    }

    pub fn set_offset(&self, xoffset: i32, yoffset: i32) {
        let mut state = self.state_mut();
        state.xoffset = xoffset;
        state.yoffset = yoffset;
    }

    pub fn set_demand_hint(&self, demand: DemandStyle) {
        self.state_mut().demand = demand;
    }

    /// Remove the backing file when the image is destroyed.
    ///
    /// The current filename is captured now.
    pub fn set_delete_on_close(&self, delete: bool) {
        let mut state = self.state_mut();
        state.delete_on_close = if delete {
            Some(PathBuf::from(&state.filename))
        } else {
            None
        };
    }

    pub fn delete_on_close(&self) -> Option<PathBuf> {
        self.state().delete_on_close.clone()
    }

    // ========================================================================
    // Kill flag
    // ========================================================================

    /// Ask every loop working on this image to stop.
    pub fn set_kill(&self, kill: bool) {
        self.inner.kill.store(kill, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.inner.kill.load(Ordering::SeqCst)
    }

    /// Fail if the kill flag is set, clearing it.
    pub fn check_kill(&self) -> ImageResult<()> {
        if self.inner.kill.swap(false, Ordering::SeqCst) {
            let name = self.filename();
            debug!("kill picked up for \"{}\"", name);
            return Err(ExecutionError::killed(&name).into());
        }
        Ok(())
    }

    // ========================================================================
    // Events and progress
    // ========================================================================

    pub fn connect<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ImageEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.connect(callback)
    }

    pub fn disconnect(&self, id: ListenerId) -> bool {
        self.inner.listeners.disconnect(id)
    }

    /// A channel receiving every later event of this image.
    pub fn subscribe(&self) -> Receiver<ImageEvent> {
        self.inner.listeners.subscribe()
    }

    pub(crate) fn emit(&self, event: &ImageEvent) {
        self.inner.listeners.emit(event);
    }

    /// Make this image the progress signaller of the pipelines it heads.
    pub fn set_progress(&self, progress: bool) {
        *self.inner.progress_signal.lock() = if progress {
            Some(Arc::downgrade(&self.inner))
        } else {
            None
        };
    }

    /// The image progress events are sent to, if any.
    pub fn progress_signal(&self) -> Option<Image> {
        let inner = self
            .inner
            .progress_signal
            .lock()
            .as_ref()
            .and_then(Weak::upgrade);
        inner.map(Image::from_inner)
    }

    pub(crate) fn inherit_progress_signal(&self, from: &Image) {
        let theirs = from.inner.progress_signal.lock().clone();
        let mut ours = self.inner.progress_signal.lock();
        if ours.is_none() {
            *ours = theirs;
        }
    }

    /// The progress record held by this image.
    ///
    /// A signalling image holds the record of every evaluation in the
    /// pipelines it heads; any other image holds its own.
    pub fn progress_snapshot(&self) -> ProgressSnapshot {
        let (name, width, height) = {
            let state = self.state();
            (state.filename.clone(), state.width, state.height)
        };
        self.inner.progress.lock().snapshot(&name, width, height)
    }

    pub(crate) fn with_progress<T>(&self, f: impl FnOnce(&mut Progress) -> T) -> T {
        f(&mut *self.inner.progress.lock())
    }

    // ========================================================================
    // Graph
    // ========================================================================

    /// Images this one reads from.
    pub fn upstream(&self) -> Vec<ImageId> {
        self.registry().upstream(self.id())
    }

    /// Images that read from this one.
    pub fn downstream(&self) -> Vec<ImageId> {
        self.registry().downstream(self.id())
    }

    /// Drop cached pixels of this image and everything downstream of it.
    ///
    /// Each reachable image has its region caches cleared and gets one
    /// [`ImageEvent::Invalidate`].
    pub fn invalidate_all(&self) {
        let images = self.registry().reachable_images(self.id(), Direction::Downstream);
        debug!("invalidate_all: {} images from {}", images.len(), self.id());
        for image in &images {
            for cache in image.registry().regions_of(image.id()) {
                cache.lock().clear();
            }
            image.emit(&ImageEvent::Invalidate);
        }
    }

    /// Send [`ImageEvent::Minimise`] to this image and everything upstream.
    pub fn minimise_all(&self) {
        let images = self.registry().reachable_images(self.id(), Direction::Upstream);
        debug!("minimise_all: {} images from {}", images.len(), self.id());
        for image in &images {
            image.emit(&ImageEvent::Minimise);
        }
    }

    // ========================================================================
    // Flat pixel access
    // ========================================================================

    /// The whole image as one flat array, materializing it if needed.
    pub fn pixels(&self) -> ImageResult<Pixels<'_>> {
        self.wio_input()?;

        let state = self.state();
        if let Storage::MemoryForeign(buffer) = &state.storage {
            let buffer = buffer.clone();
            let len = state.sizeof_image() as usize;
            let name = state.filename.clone();
            drop(state);
            let guard = buffer.read_arc();
            if guard.len() < len {
                return Err(ModeError::NoData { image: name }.into());
            }
            return Ok(Pixels::Foreign { guard, len });
        }

        RwLockReadGuard::try_map(state, |desc| desc.data())
            .map(Pixels::Local)
            .map_err(|state| {
                ModeError::NoData {
                    image: state.filename.clone(),
                }
                .into()
            })
    }

    /// Edit the flat pixel array in place.
    ///
    /// Everything downstream is invalidated afterwards.
    pub fn with_pixels_mut<T>(&self, f: impl FnOnce(&mut [u8]) -> T) -> ImageResult<T> {
        self.make_writable()?;

        let result = {
            let mut state = self.state_mut();
            if let Storage::MemoryForeign(buffer) = &state.storage {
                let buffer = buffer.clone();
                let len = state.sizeof_image() as usize;
                let name = state.filename.clone();
                drop(state);
                let mut guard = buffer.write();
                let data = guard
                    .get_mut(..len)
                    .ok_or(ModeError::NoData { image: name })?;
                f(data)
            } else {
                let name = state.filename.clone();
                let data = state
                    .data_mut()
                    .ok_or(ModeError::NoData { image: name })?;
                f(data)
            }
        };

        self.invalidate_all();
        Ok(result)
    }

    /// Take the owned buffer of a memory image, leaving it without data.
    pub(crate) fn take_buffer(&self) -> ImageResult<Vec<u8>> {
        let mut state = self.state_mut();
        let size = state.sizeof_image() as usize;
        let name = state.filename.clone();
        let taken = match &mut state.storage {
            Storage::MemoryOwned(buffer) => buffer.take(),
            _ => None,
        };
        match taken {
            Some(mut buffer) => {
                buffer.truncate(size);
                Ok(buffer)
            }
            None => Err(ModeError::NoData { image: name }.into()),
        }
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn summary(&self) -> String {
        self.state().summary()
    }

    /// Header fields, mode and links as JSON.
    pub fn dump(&self) -> serde_json::Value {
        let mut value = self.state().dump();
        if let Some(object) = value.as_object_mut() {
            object.insert("id".into(), self.id().to_string().into());
            object.insert(
                "upstream".into(),
                self.upstream().iter().map(|id| id.to_string()).collect(),
            );
            object.insert(
                "downstream".into(),
                self.downstream().iter().map(|id| id.to_string()).collect(),
            );
        }
        value
    }

    /// Problems with this image, empty if none.
    pub fn sanity(&self) -> Vec<String> {
        let mut problems = self.state().sanity();
        problems.extend(
            self.registry()
                .check_links_of(self.id())
                .into_iter()
                .map(|v| v.to_string()),
        );
        problems
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.state.try_read() {
            Some(state) => f
                .debug_struct("Image")
                .field("id", &self.inner.id)
                .field("filename", &state.filename)
                .field("storage", &state.storage)
                .finish(),
            None => f
                .debug_struct("Image")
                .field("id", &self.inner.id)
                .finish_non_exhaustive(),
        }
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

impl Drop for ImageInner {
    fn drop(&mut self) {
        let id = self.id;
        let state = self.state.get_mut();
        debug!("closing {} \"{}\"", id, state.filename);

        state.dispose();
        if let Err(e) = state.finalize() {
            warn!("{}", e);
        }

        let leftovers = self.registry.forget(id);
        if leftovers.regions > 0 {
            warn!(
                "\"{}\" destroyed with {} active regions",
                state.filename, leftovers.regions
            );
        }
        if leftovers.windows > 0 {
            warn!(
                "\"{}\" destroyed with {} active windows",
                state.filename, leftovers.windows
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CoreConfig;

    fn registry() -> Arc<Registry> {
        Registry::new(CoreConfig::default())
    }

    #[test]
    fn test_drop_unregisters() {
        let registry = registry();
        let image = Image::new(&registry).unwrap();
        let id = image.id();
        assert!(registry.image(id).is_some());

        drop(image);
        assert!(registry.image(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_kill_flag_clears_on_check() {
        let registry = registry();
        let image = Image::new(&registry).unwrap();
        assert!(image.check_kill().is_ok());

        image.set_kill(true);
        assert!(image.is_killed());
        let err = image.check_kill().unwrap_err();
        assert!(err.is_kill());
        assert!(!image.is_killed());
        assert!(image.check_kill().is_ok());
    }

    #[test]
    fn test_progress_signal() {
        let registry = registry();
        let image = Image::new(&registry).unwrap();
        assert!(image.progress_signal().is_none());

        image.set_progress(true);
        assert!(image.progress_signal().unwrap().ptr_eq(&image));

        let child = Image::new(&registry).unwrap();
        child.inherit_progress_signal(&image);
        assert!(child.progress_signal().unwrap().ptr_eq(&image));

        image.set_progress(false);
        assert!(image.progress_signal().is_none());
    }

    #[test]
    fn test_delete_on_close_captures_filename() {
        let registry = registry();
        let image = Image::new(&registry).unwrap();
        image.set_delete_on_close(true);
        assert_eq!(image.delete_on_close(), Some(PathBuf::from(image.filename())));
        image.set_delete_on_close(false);
        assert!(image.delete_on_close().is_none());
    }

    #[test]
    fn test_dump_has_links() {
        let registry = registry();
        let a = Image::new(&registry).unwrap();
        let b = Image::new(&registry).unwrap();
        registry.link(a.id(), b.id());

        let dump = b.dump();
        assert_eq!(dump["upstream"][0], a.id().to_string());
        assert_eq!(dump["storage"], "Lazy");
        assert!(b.sanity().is_empty());
    }
}
