//! # Change Aggregator
//!
//! Turns a bursty stream of [`ChangeBatch`]es into "persist now" decisions.
//!
//! ## Design
//!
//! - Irrelevant batches have no side effects
//! - Every relevant batch restarts a single debounce deadline
//! - Shape removals use a zero window, edits the update delay
//! - The snapshot is taken when the deadline fires, never per event
//!
//! ```text
//!            observe            deadline reached
//!   Idle ───────────▶ Pending ─────────────────▶ Firing ──▶ Idle
//!    ▲                  │  ▲                                 │
//!    │   cancel/flush   │  └── observe (restart) ◀───────────┘
//!    └──────────────────┘
//! ```

use std::time::Duration;
use tokio::time::Instant;

use crate::changes::{ChangeBatch, ChangeClass};

/// Debounce windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Quiet period after creates and updates
    pub update_delay: Duration,

    /// Quiet period after a removal
    pub deletion_delay: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            update_delay: Duration::from_millis(500),
            deletion_delay: Duration::ZERO,
        }
    }
}

impl DebounceConfig {
    fn window(&self, class: ChangeClass) -> Option<Duration> {
        match class {
            ChangeClass::Irrelevant => None,
            ChangeClass::Edit => Some(self.update_delay),
            ChangeClass::Deletion => Some(self.deletion_delay),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Pending {
        deadline: Instant,
        /// Class of the batch that set the deadline
        class: ChangeClass,
    },
    /// Deadline reached, snapshot being handed off
    Firing,
}

/// Why a save is being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveTrigger {
    pub class: ChangeClass,
    /// Relevant batches absorbed into this save
    pub coalesced: usize,
}

/// Debounce state machine for one document session
#[derive(Debug)]
pub struct ChangeAggregator {
    config: DebounceConfig,
    state: DebounceState,
    should_save: bool,
    coalesced: usize,
}

impl ChangeAggregator {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            state: DebounceState::Idle,
            should_save: false,
            coalesced: 0,
        }
    }

    /// Feed one batch. Returns the new deadline if the batch was relevant.
    pub fn observe(&mut self, batch: &ChangeBatch, now: Instant) -> Option<Instant> {
        let class = batch.classify();
        let window = self.config.window(class)?;

        self.should_save = true;
        self.coalesced += 1;

        let deadline = now + window;
        self.state = DebounceState::Pending { deadline, class };

        tracing::debug!(
            ?class,
            window_ms = window.as_millis() as u64,
            coalesced = self.coalesced,
            "Debounce deadline restarted"
        );

        Some(deadline)
    }

    /// Deadline of the pending save, if any
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Pending { deadline, .. } => Some(deadline),
            _ => None,
        }
    }

    /// Move a due deadline to `Firing`.
    ///
    /// Returns the trigger only when the should-save flag was still set; the
    /// flag is cleared. Without the flag the aggregator goes straight back to
    /// `Idle`. After a `Some`, call [`end_fire`](Self::end_fire) once the
    /// snapshot has been handed off.
    pub fn begin_fire(&mut self, now: Instant) -> Option<SaveTrigger> {
        let class = match self.state {
            DebounceState::Pending { deadline, class } if now >= deadline => class,
            _ => return None,
        };

        if !std::mem::take(&mut self.should_save) {
            self.state = DebounceState::Idle;
            self.coalesced = 0;
            return None;
        }

        self.state = DebounceState::Firing;
        Some(SaveTrigger {
            class,
            coalesced: std::mem::take(&mut self.coalesced),
        })
    }

    pub fn end_fire(&mut self) {
        if self.state == DebounceState::Firing {
            self.state = DebounceState::Idle;
        }
    }

    /// Consume pending work for an out-of-band save.
    ///
    /// Cancels the deadline and returns whether a save was owed.
    pub fn flush(&mut self) -> bool {
        if matches!(self.state, DebounceState::Pending { .. }) {
            self.state = DebounceState::Idle;
        }
        self.coalesced = 0;
        std::mem::take(&mut self.should_save)
    }

    /// Drop everything (session closing)
    pub fn cancel(&mut self) {
        self.state = DebounceState::Idle;
        self.should_save = false;
        self.coalesced = 0;
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn should_save(&self) -> bool {
        self.should_save
    }
}
