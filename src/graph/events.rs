//! Image events and listener registration.
//!
//! The event set is closed. Listeners are plain callbacks; channel
//! subscribers are kept beside them for callers that prefer to poll, and are
//! dropped once their receiver is gone.

use crate::execution::progress::ProgressSnapshot;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Something that happened to an image.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageEvent {
    /// Evaluation is about to start.
    PreEval(ProgressSnapshot),
    /// Some pixels were computed.
    Eval(ProgressSnapshot),
    /// Evaluation finished, successfully or not.
    PostEval(ProgressSnapshot),
    /// All pixels have been written.
    Written,
    /// Cached pixels derived from this image are stale.
    Invalidate,
    /// Drop caches that are not needed any more.
    Minimise,
}

impl ImageEvent {
    /// Short name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ImageEvent::PreEval(_) => "preeval",
            ImageEvent::Eval(_) => "eval",
            ImageEvent::PostEval(_) => "posteval",
            ImageEvent::Written => "written",
            ImageEvent::Invalidate => "invalidate",
            ImageEvent::Minimise => "minimise",
        }
    }
}

/// Handle returned by [`Listeners::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A registered callback.
pub type Listener = Arc<dyn Fn(&ImageEvent) + Send + Sync>;

/// The listeners attached to one image.
#[derive(Default)]
pub struct Listeners {
    next: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Listener)>>,
    subscribers: Mutex<Vec<Sender<ImageEvent>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback.
    pub fn connect<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ImageEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns false if it was not registered.
    pub fn disconnect(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(other, _)| *other != id);
        entries.len() != before
    }

    /// A channel receiving a copy of every later event.
    ///
    /// The subscription ends at the first event emitted after the receiver
    /// is dropped.
    pub fn subscribe(&self) -> Receiver<ImageEvent> {
        let (sender, receiver) = unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Call every listener with `event`.
    ///
    /// Callbacks run outside the listener lock, so they may connect or
    /// disconnect listeners themselves.
    pub fn emit(&self, event: &ImageEvent) {
        let callbacks: Vec<Listener> = self
            .entries
            .read()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(event);
        }

        self.subscribers
            .lock()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }

    /// Callbacks plus live channel subscribers.
    pub fn len(&self) -> usize {
        self.entries.read().len() + self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_connect_and_disconnect() {
        let listeners = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let id = listeners.connect(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });
        listeners.emit(&ImageEvent::Written);
        assert_eq!(count.load(Ordering::Relaxed), 1);

        assert!(listeners.disconnect(id));
        assert!(!listeners.disconnect(id));
        listeners.emit(&ImageEvent::Written);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscribe() {
        let listeners = Listeners::new();
        let events = listeners.subscribe();
        listeners.emit(&ImageEvent::Invalidate);
        listeners.emit(&ImageEvent::Minimise);

        let kinds: Vec<_> = events.try_iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["invalidate", "minimise"]);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let listeners = Listeners::new();
        for _ in 0..1000 {
            drop(listeners.subscribe());
            listeners.emit(&ImageEvent::Invalidate);
        }
        assert!(listeners.is_empty());

        let kept = listeners.subscribe();
        drop(listeners.subscribe());
        assert_eq!(listeners.len(), 2);
        listeners.emit(&ImageEvent::Written);
        assert_eq!(listeners.len(), 1);
        assert_eq!(kept.try_iter().count(), 1);
    }

    #[test]
    fn test_listener_can_reenter() {
        let listeners = Arc::new(Listeners::new());
        let inner = listeners.clone();
        listeners.connect(move |_| {
            inner.connect(|_| {});
        });
        listeners.emit(&ImageEvent::Written);
        assert_eq!(listeners.len(), 2);
    }
}
