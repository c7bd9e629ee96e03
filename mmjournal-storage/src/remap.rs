//! Private view remapping.
//!
//! Copy-on-write private views grow as pages are written. Remapping a file
//! drops those copies. Each pass only covers a fraction of the open files,
//! continuing round-robin from where the previous pass stopped, so a
//! process with many files never remaps them all at once.
//!
//! Callers must hold the exclusive lock and have no pending write intents.

use crate::error::StorageError;
use crate::registry::FileRegistry;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Default time to cycle through every file.
pub const DEFAULT_FULL_CYCLE: Duration = Duration::from_secs(2);

/// How much of the file set a remap pass covers.
#[derive(Debug, Clone)]
pub struct RemapPolicy {
    /// Target time for a full cycle through the open files.
    pub full_cycle: Duration,
    /// Remap every file on every pass.
    pub always_remap: bool,
    /// Private-view bytes that, once written, justify a full pass.
    pub private_bytes_limit: u64,
}

impl Default for RemapPolicy {
    fn default() -> Self {
        Self {
            full_cycle: DEFAULT_FULL_CYCLE,
            always_remap: false,
            private_bytes_limit: 100 * 1024 * 1024,
        }
    }
}

impl RemapPolicy {
    /// Fraction of files due, given the time since the last pass and the
    /// private-view bytes written since then. The larger reason wins.
    pub fn fraction(&self, elapsed: Duration, private_bytes: u64) -> f64 {
        let mut fraction = if self.always_remap || self.full_cycle.is_zero() {
            1.0
        } else {
            elapsed.as_secs_f64() / self.full_cycle.as_secs_f64()
        };

        if self.private_bytes_limit > 0 {
            let by_bytes = private_bytes as f64 / self.private_bytes_limit as f64;
            if by_bytes > fraction {
                tracing::debug!("Remap fraction raised to {:.3} by private view bytes", by_bytes);
                fraction = by_bytes;
            }
        }

        fraction.min(1.0)
    }
}

/// Result of one remap pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RemapPass {
    pub fraction: f64,
    /// Files visited this pass.
    pub considered: usize,
    /// Visited files whose private view had diverged and was recreated.
    pub remapped: usize,
}

struct RemapState {
    last_pass: Instant,
    start_at: usize,
}

/// Round-robin remap scheduler.
pub struct Remapper {
    state: Mutex<RemapState>,
}

impl Default for Remapper {
    fn default() -> Self {
        Self::new()
    }
}

impl Remapper {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemapState {
                last_pass: Instant::now(),
                start_at: 0,
            }),
        }
    }

    /// Runs a pass sized by `policy`.
    pub fn remap_some(
        &self,
        registry: &FileRegistry,
        policy: &RemapPolicy,
    ) -> Result<RemapPass, StorageError> {
        let fraction = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_pass);
            state.last_pass = now;
            policy.fraction(elapsed, registry.private_map_bytes())
        };
        registry.reset_private_map_bytes();
        self.remap_fraction(registry, fraction)
    }

    /// Visits `fraction` of the open files (at least one), continuing from
    /// the previous pass, and remaps those that diverged.
    pub fn remap_fraction(
        &self,
        registry: &FileRegistry,
        fraction: f64,
    ) -> Result<RemapPass, StorageError> {
        let files = registry.files();
        let total = files.len();
        let mut pass = RemapPass {
            fraction,
            ..RemapPass::default()
        };
        if total == 0 {
            return Ok(pass);
        }

        let ntodo = ((total as f64 * fraction) as usize).clamp(1, total);
        let mut state = self.state.lock();
        let start_at = state.start_at % total;

        for i in 0..ntodo {
            let file = &files[(start_at + i) % total];
            pass.considered += 1;
            if file.needs_remap() {
                file.remap_private()?;
                pass.remapped += 1;
            }
        }
        state.start_at = (start_at + ntodo) % total;

        tracing::trace!(
            "Remap pass: fraction={:.3}, visited {} of {} files, remapped {}",
            fraction,
            pass.considered,
            total,
            pass.remapped
        );
        Ok(pass)
    }
}
