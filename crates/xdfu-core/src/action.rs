//! Flash action - the user-facing trigger for a firmware update.

use std::sync::{MutexGuard, PoisonError};

use tracing::{error, info, instrument};

use crate::error::DfuError;
use crate::session::{DfuEngine, SharedEngine};
use crate::state::SessionOutcome;
use crate::transport::DfuTransport;

/// How [`FlashAction::play`] runs the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Start the session and return; the host loop calls `poll`.
    #[default]
    Cooperative,
    /// Poll until the session ends. The engine lock is released between
    /// steps so other tasks can cancel.
    Blocking,
}

/// Starts a firmware update on a shared engine.
pub struct FlashAction<T: DfuTransport> {
    engine: SharedEngine<T>,
    mode: ExecutionMode,
}

impl<T: DfuTransport> FlashAction<T> {
    pub fn new(engine: SharedEngine<T>) -> Self {
        Self {
            engine,
            mode: ExecutionMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    fn lock(&self) -> MutexGuard<'_, DfuEngine<T>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the update.
    ///
    /// Returns the outcome in blocking mode, `None` in cooperative mode.
    /// A request while a session runs is rejected without touching it.
    #[instrument(skip(self), fields(mode = ?self.mode))]
    pub fn play(&self) -> Result<Option<SessionOutcome>, DfuError> {
        if let Err(e) = self.lock().begin() {
            error!(error = %e, "Flash request rejected");
            return Err(e);
        }
        info!("Flash started");

        match self.mode {
            ExecutionMode::Cooperative => Ok(None),
            ExecutionMode::Blocking => loop {
                let mut engine = self.lock();
                engine.poll();
                if !engine.is_active() {
                    return Ok(engine.last_outcome());
                }
            },
        }
    }
}

/// Start a cooperative update on `engine`.
pub fn flash<T: DfuTransport>(engine: &SharedEngine<T>) -> Result<(), DfuError> {
    FlashAction::new(engine.clone()).play().map(|_| ())
}
