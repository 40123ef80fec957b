//! Progress tracking for evaluation.
//!
//! One [`Progress`] record lives on each image. Only the signalling image of a
//! pipeline updates its record and emits progress events.

use crate::graph::events::ImageEvent;
use log::info;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Fraction of work that must be done before an ETA is reported.
pub const ETA_THRESHOLD: f64 = 0.1;

/// Evaluation progress of one image.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Start time.
    start: Instant,
    /// Pixels to compute in total.
    total_pels: u64,
    /// Pixels computed so far.
    processed: u64,
    /// Elapsed time at the last update.
    run: Duration,
    /// Estimated time remaining, once enough work is done.
    eta: Option<Duration>,
    /// Percentage complete, rounded.
    percent: u32,
}

/// Copy of a progress record handed to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub image: String,
    pub width: u32,
    pub height: u32,
    pub total_pels: u64,
    pub processed: u64,
    pub percent: u32,
    pub run: Duration,
    pub eta: Option<Duration>,
}

impl Progress {
    pub fn new(total_pels: u64) -> Self {
        Self {
            start: Instant::now(),
            total_pels,
            processed: 0,
            run: Duration::ZERO,
            eta: None,
            percent: 0,
        }
    }

    /// Restart the clock for a new evaluation of `total_pels` pixels.
    pub fn reset(&mut self, total_pels: u64) {
        *self = Self::new(total_pels);
    }

    /// Record `processed` pixels done so far.
    pub fn update(&mut self, processed: u64) {
        let elapsed = self.start.elapsed();
        self.update_at(processed, elapsed);
    }

    /// Record `processed` pixels done after `elapsed`.
    pub fn update_at(&mut self, processed: u64, elapsed: Duration) {
        self.processed = processed.min(self.total_pels);
        self.run = elapsed;

        let fraction = if self.total_pels == 0 {
            1.0
        } else {
            self.processed as f64 / self.total_pels as f64
        };

        // Early estimates are too noisy to show.
        self.eta = if fraction > ETA_THRESHOLD {
            Some(elapsed.mul_f64(1.0 / fraction - 1.0))
        } else {
            None
        };
        self.percent = (100.0 * fraction).round() as u32;
    }

    pub fn total_pels(&self) -> u64 {
        self.total_pels
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn percent(&self) -> u32 {
        self.percent
    }

    pub fn run(&self) -> Duration {
        self.run
    }

    pub fn eta(&self) -> Option<Duration> {
        self.eta
    }

    pub fn snapshot(&self, image: &str, width: u32, height: u32) -> ProgressSnapshot {
        ProgressSnapshot {
            image: image.to_string(),
            width,
            height,
            total_pels: self.total_pels,
            processed: self.processed,
            percent: self.percent,
            run: self.run,
            eta: self.eta,
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new(0)
    }
}

/// A listener that logs evaluation progress at `info`.
///
/// Only percentage changes are logged, so a long evaluation produces at most
/// about a hundred lines.
pub fn progress_reporter() -> impl Fn(&ImageEvent) + Send + Sync + 'static {
    let last = AtomicU32::new(u32::MAX);
    move |event| match event {
        ImageEvent::PreEval(p) => {
            last.store(u32::MAX, Ordering::Relaxed);
            info!("{}: {} x {} pixels", p.image, p.width, p.height);
        }
        ImageEvent::Eval(p) => {
            if last.swap(p.percent, Ordering::Relaxed) != p.percent {
                match p.eta {
                    Some(eta) => info!(
                        "{}: {}% complete, {}s remaining",
                        p.image,
                        p.percent,
                        eta.as_secs()
                    ),
                    None => info!("{}: {}% complete", p.image, p.percent),
                }
            }
        }
        ImageEvent::PostEval(p) => {
            info!("{}: done in {:.3}s", p.image, p.run.as_secs_f64());
        }
        _ => {}
    }
}
