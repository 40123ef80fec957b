//! The image registry and its link table.
//!
//! Every image belongs to one [`Registry`]. The registry owns the
//! upstream/downstream link sets of all its images and the bookkeeping of
//! their active regions and windows, all behind one lock.
//!
//! Lock order: the registry lock is always the innermost lock. It is never
//! held while taking an image's state lock, while calling a producer or a
//! listener, during file I/O, or while dropping an [`Image`].

use crate::core::config::CoreConfig;
use crate::core::error::ImageId;
use crate::execution::format::{FormatLayer, StandardFormats};
use crate::execution::image::{Image, ImageInner};
use crate::execution::region::RegionCache;
use indexmap::{IndexMap, IndexSet};
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Which way to follow links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards the images this one reads from.
    Upstream,
    /// Towards the images that read from this one.
    Downstream,
}

/// Identifier of a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub u64);

/// Link sets of one image.
#[derive(Debug, Default, Clone)]
pub struct LinkSets {
    pub upstream: IndexSet<ImageId>,
    pub downstream: IndexSet<ImageId>,
}

/// An inconsistency found by [`LinkTable::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkViolation {
    /// `upstream` lists `image` as downstream, but `image` does not list it back.
    MissingUpstream { image: ImageId, upstream: ImageId },
    /// `downstream` lists `image` as upstream, but `image` does not list it back.
    MissingDownstream { image: ImageId, downstream: ImageId },
}

impl fmt::Display for LinkViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkViolation::MissingUpstream { image, upstream } => write!(
                f,
                "upstream broken: {} is downstream of {} but does not list it",
                image, upstream
            ),
            LinkViolation::MissingDownstream { image, downstream } => write!(
                f,
                "downstream broken: {} is upstream of {} but does not list it",
                image, downstream
            ),
        }
    }
}

/// Regions and windows still open on an image when it was forgotten.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Leftovers {
    pub regions: usize,
    pub windows: usize,
}

// ============================================================================
// LinkTable
// ============================================================================

/// Symmetric upstream/downstream link sets keyed by image ID.
///
/// Pure data; all locking happens in [`Registry`].
#[derive(Debug, Default, Clone)]
pub struct LinkTable {
    links: HashMap<ImageId, LinkSets>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `downstream` reads from `upstream`.
    pub fn link(&mut self, upstream: ImageId, downstream: ImageId) {
        self.links
            .entry(upstream)
            .or_default()
            .downstream
            .insert(downstream);
        self.links
            .entry(downstream)
            .or_default()
            .upstream
            .insert(upstream);
    }

    /// Remove one link in both directions.
    pub fn unlink(&mut self, upstream: ImageId, downstream: ImageId) {
        if let Some(sets) = self.links.get_mut(&upstream) {
            sets.downstream.shift_remove(&downstream);
        }
        if let Some(sets) = self.links.get_mut(&downstream) {
            sets.upstream.shift_remove(&upstream);
        }
        self.prune(upstream);
        self.prune(downstream);
    }

    /// Remove `id` and every link that mentions it from both sides.
    pub fn break_all(&mut self, id: ImageId) {
        let Some(sets) = self.links.remove(&id) else {
            return;
        };
        for partner in sets.upstream.iter() {
            if let Some(other) = self.links.get_mut(partner) {
                other.downstream.shift_remove(&id);
            }
        }
        for partner in sets.downstream.iter() {
            if let Some(other) = self.links.get_mut(partner) {
                other.upstream.shift_remove(&id);
            }
        }
        for partner in sets.upstream.iter().chain(sets.downstream.iter()) {
            self.prune(*partner);
        }
    }

    fn prune(&mut self, id: ImageId) {
        if self
            .links
            .get(&id)
            .is_some_and(|sets| sets.upstream.is_empty() && sets.downstream.is_empty())
        {
            self.links.remove(&id);
        }
    }

    pub fn upstream(&self, id: ImageId) -> Vec<ImageId> {
        self.links
            .get(&id)
            .map(|sets| sets.upstream.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn downstream(&self, id: ImageId) -> Vec<ImageId> {
        self.links
            .get(&id)
            .map(|sets| sets.downstream.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether `id` takes part in any link.
    pub fn is_linked(&self, id: ImageId) -> bool {
        self.links.contains_key(&id)
    }

    /// Every image reachable from `start` in `direction`, `start` included.
    ///
    /// Depth-first, in visiting order. Each image appears once even if the
    /// links contain diamonds or cycles.
    pub fn reachable(&self, start: ImageId, direction: Direction) -> Vec<ImageId> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![start];

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            result.push(current);

            if let Some(sets) = self.links.get(&current) {
                let next = match direction {
                    Direction::Upstream => &sets.upstream,
                    Direction::Downstream => &sets.downstream,
                };
                // Reversed so the first partner is visited first.
                for partner in next.iter().rev() {
                    if !visited.contains(partner) {
                        stack.push(*partner);
                    }
                }
            }
        }

        result
    }

    /// Every asymmetric link. Nothing is repaired.
    pub fn check(&self) -> Vec<LinkViolation> {
        let mut violations = Vec::new();

        for (id, sets) in &self.links {
            for upstream in &sets.upstream {
                let mirrored = self
                    .links
                    .get(upstream)
                    .is_some_and(|other| other.downstream.contains(id));
                if !mirrored {
                    violations.push(LinkViolation::MissingDownstream {
                        image: *upstream,
                        downstream: *id,
                    });
                }
            }
            for downstream in &sets.downstream {
                let mirrored = self
                    .links
                    .get(downstream)
                    .is_some_and(|other| other.upstream.contains(id));
                if !mirrored {
                    violations.push(LinkViolation::MissingUpstream {
                        image: *downstream,
                        upstream: *id,
                    });
                }
            }
        }

        violations
    }

    /// Number of images with at least one link.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    #[cfg(test)]
    fn insert_one_sided(&mut self, upstream: ImageId, downstream: ImageId) {
        self.links
            .entry(upstream)
            .or_default()
            .downstream
            .insert(downstream);
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct Tables {
    images: HashMap<ImageId, Weak<ImageInner>>,
    links: LinkTable,
    regions: HashMap<ImageId, IndexMap<RegionId, Weak<Mutex<RegionCache>>>>,
    windows: HashMap<ImageId, usize>,
}

/// Shared home of a set of images.
pub struct Registry {
    tables: Mutex<Tables>,
    config: CoreConfig,
    formats: Arc<dyn FormatLayer>,
    serial: AtomicU64,
}

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

impl Registry {
    /// A registry with the standard format layer.
    pub fn new(config: CoreConfig) -> Arc<Self> {
        Self::with_formats(config, Arc::new(StandardFormats::new()))
    }

    pub fn with_formats(config: CoreConfig, formats: Arc<dyn FormatLayer>) -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(Tables::default()),
            config,
            formats,
            serial: AtomicU64::new(0),
        })
    }

    /// The process-wide registry, configured from the environment.
    pub fn global() -> Arc<Self> {
        GLOBAL
            .get_or_init(|| Self::new(CoreConfig::from_env()))
            .clone()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn formats(&self) -> &Arc<dyn FormatLayer> {
        &self.formats
    }

    /// A fresh name like `temp-3`.
    pub fn next_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.serial.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(&self, id: ImageId, inner: Weak<ImageInner>) {
        self.tables.lock().images.insert(id, inner);
    }

    /// Drop every trace of `id`. Called when its image is destroyed.
    pub(crate) fn forget(&self, id: ImageId) -> Leftovers {
        let mut tables = self.tables.lock();
        tables.images.remove(&id);
        tables.links.break_all(id);
        let regions = tables
            .regions
            .remove(&id)
            .map(|r| r.values().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0);
        let windows = tables.windows.remove(&id).unwrap_or(0);
        Leftovers { regions, windows }
    }

    /// Number of live images.
    pub fn len(&self) -> usize {
        self.tables.lock().images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a live image.
    pub fn image(&self, id: ImageId) -> Option<Image> {
        let inner = self.tables.lock().images.get(&id)?.upgrade();
        inner.map(Image::from_inner)
    }

    // ------------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------------

    /// Record that `downstream` reads from `upstream`.
    pub fn link(&self, upstream: ImageId, downstream: ImageId) {
        debug!("link {} -> {}", upstream, downstream);
        self.tables.lock().links.link(upstream, downstream);
    }

    pub fn unlink(&self, upstream: ImageId, downstream: ImageId) {
        self.tables.lock().links.unlink(upstream, downstream);
    }

    pub fn upstream(&self, id: ImageId) -> Vec<ImageId> {
        self.tables.lock().links.upstream(id)
    }

    pub fn downstream(&self, id: ImageId) -> Vec<ImageId> {
        self.tables.lock().links.downstream(id)
    }

    /// IDs reachable from `start`, `start` included, depth-first.
    pub fn reachable(&self, start: ImageId, direction: Direction) -> Vec<ImageId> {
        self.tables.lock().links.reachable(start, direction)
    }

    /// Live images reachable from `start`, `start` included.
    ///
    /// The lock is released before the images are returned, so dropping them
    /// is safe.
    pub fn reachable_images(&self, start: ImageId, direction: Direction) -> Vec<Image> {
        let inners: Vec<Arc<ImageInner>> = {
            let tables = self.tables.lock();
            tables
                .links
                .reachable(start, direction)
                .into_iter()
                .filter_map(|id| tables.images.get(&id).and_then(Weak::upgrade))
                .collect()
        };
        inners.into_iter().map(Image::from_inner).collect()
    }

    /// Consistency check over every link.
    pub fn check_links(&self) -> Vec<LinkViolation> {
        self.tables.lock().links.check()
    }

    /// Violations that involve `id`.
    pub fn check_links_of(&self, id: ImageId) -> Vec<LinkViolation> {
        self.check_links()
            .into_iter()
            .filter(|v| match v {
                LinkViolation::MissingUpstream { image, upstream } => *image == id || *upstream == id,
                LinkViolation::MissingDownstream { image, downstream } => {
                    *image == id || *downstream == id
                }
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Regions and windows
    // ------------------------------------------------------------------------

    pub(crate) fn add_region(&self, image: ImageId, cache: Weak<Mutex<RegionCache>>) -> RegionId {
        let id = RegionId(self.serial.fetch_add(1, Ordering::Relaxed));
        self.tables
            .lock()
            .regions
            .entry(image)
            .or_default()
            .insert(id, cache);
        id
    }

    pub(crate) fn remove_region(&self, image: ImageId, region: RegionId) {
        let mut tables = self.tables.lock();
        if let Some(regions) = tables.regions.get_mut(&image) {
            regions.shift_remove(&region);
            if regions.is_empty() {
                tables.regions.remove(&image);
            }
        }
    }

    /// Caches of the live regions on `image`.
    pub(crate) fn regions_of(&self, image: ImageId) -> Vec<Arc<Mutex<RegionCache>>> {
        self.tables
            .lock()
            .regions
            .get(&image)
            .map(|r| r.values().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    pub fn region_count(&self, image: ImageId) -> usize {
        self.tables
            .lock()
            .regions
            .get(&image)
            .map(IndexMap::len)
            .unwrap_or(0)
    }

    pub(crate) fn add_window(&self, image: ImageId) {
        *self.tables.lock().windows.entry(image).or_default() += 1;
    }

    pub(crate) fn remove_window(&self, image: ImageId) {
        let mut tables = self.tables.lock();
        if let Some(count) = tables.windows.get_mut(&image) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                tables.windows.remove(&image);
            }
        }
    }

    pub fn window_count(&self, image: ImageId) -> usize {
        self.tables.lock().windows.get(&image).copied().unwrap_or(0)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("Registry")
            .field("images", &tables.images.len())
            .field("linked", &tables.links.len())
            .field("config", &self.config)
            .finish()
    }
}
