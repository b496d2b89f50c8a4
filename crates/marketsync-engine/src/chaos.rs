//! Fault injection that simulates a process crash mid-run.
//!
//! The injector is consulted right before a batch is committed. When it
//! fires, the orchestrator stops every in-flight source task and closes the
//! run as failed with the abort as its last error. Batches committed
//! earlier stay committed and resumable; the pending batch is never
//! written.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use marketsync_types::state::SourceName;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::types::{ChaosConfig, ChaosStrategyKind};

/// Simulated crash raised by the [`ChaosInjector`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("chaos abort injected in source '{source_name}' at record {position} of {total}")]
pub struct ChaosAbort {
    pub source_name: SourceName,
    /// Records of the source that would have been committed by the batch.
    pub position: u64,
    pub total: u64,
}

/// Deterministic trigger position within one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaosPoint {
    /// Past half of the source's fetched records.
    Midpoint,
    /// Past this many records.
    AfterRecords(u64),
}

/// When the injector fires.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChaosStrategy {
    Never,
    AtFixedPoint(ChaosPoint),
    Randomized { probability: f64, seed: Option<u64> },
}

impl ChaosStrategy {
    /// Strategy selected by the pipeline's `chaos` section.
    #[must_use]
    pub fn from_config(config: &ChaosConfig) -> Self {
        if !config.enabled {
            return Self::Never;
        }
        match config.strategy {
            ChaosStrategyKind::Midpoint => Self::AtFixedPoint(ChaosPoint::Midpoint),
            ChaosStrategyKind::AfterRecords => {
                Self::AtFixedPoint(ChaosPoint::AfterRecords(config.after_records))
            }
            ChaosStrategyKind::Random => Self::Randomized {
                probability: config.probability,
                seed: config.seed,
            },
        }
    }
}

/// Shared by all source tasks of one run; fires at most once.
pub struct ChaosInjector {
    strategy: ChaosStrategy,
    rng: Mutex<StdRng>,
    fired: AtomicBool,
}

impl ChaosInjector {
    #[must_use]
    pub fn new(strategy: ChaosStrategy) -> Self {
        let rng = match strategy {
            ChaosStrategy::Randomized {
                seed: Some(seed), ..
            } => StdRng::seed_from_u64(seed),
            _ => StdRng::from_entropy(),
        };
        Self {
            strategy,
            rng: Mutex::new(rng),
            fired: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self::new(ChaosStrategy::Never)
    }

    #[must_use]
    pub fn strategy(&self) -> ChaosStrategy {
        self.strategy
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.strategy != ChaosStrategy::Never
    }

    /// Decide whether the batch that brings `source` to `position` of
    /// `total` records may commit.
    ///
    /// # Errors
    ///
    /// Returns [`ChaosAbort`] when the strategy fires.
    pub fn before_commit(
        &self,
        source: &SourceName,
        position: u64,
        total: u64,
    ) -> Result<(), ChaosAbort> {
        let trigger = match self.strategy {
            ChaosStrategy::Never => false,
            ChaosStrategy::AtFixedPoint(ChaosPoint::Midpoint) => position.saturating_mul(2) > total,
            ChaosStrategy::AtFixedPoint(ChaosPoint::AfterRecords(n)) => position > n,
            ChaosStrategy::Randomized { probability, .. } => self
                .rng
                .lock()
                .map(|mut rng| rng.gen_bool(probability.clamp(0.0, 1.0)))
                .unwrap_or(false),
        };
        if !trigger || self.fired.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let abort = ChaosAbort {
            source_name: source.clone(),
            position,
            total,
        };
        tracing::error!(
            source = %source,
            position,
            total,
            "Chaos abort injected"
        );
        Err(abort)
    }

    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Default for ChaosInjector {
    fn default() -> Self {
        Self::disabled()
    }
}
