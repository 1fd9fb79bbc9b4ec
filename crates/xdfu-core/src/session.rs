//! DFU engine - drives one device's sessions.
//!
//! The engine owns the device handle, the event bus and at most one
//! `TransferSession`. `poll` advances the session by one bounded step so a
//! cooperative host loop can interleave other work between chunks.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, instrument, warn};

use crate::device::DeviceHandle;
use crate::error::DfuError;
use crate::events::{DfuObserver, EventBus};
use crate::image::Version;
use crate::state::{DfuPhase, HandleResult, HandlerContext, SessionOutcome, TransferSession, step};
use crate::transport::DfuTransport;

/// Engine shared between tasks; the mutex serializes bus access per device.
pub type SharedEngine<T> = Arc<Mutex<DfuEngine<T>>>;

/// Result of [`DfuEngine::setup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    /// The bundled image is already running.
    UpToDate(Version),
    /// No image is bundled; nothing to compare against.
    NoFirmware(Version),
    /// The running version differs and a session was started.
    UpdateStarted { running: Version, target: Version },
}

/// Firmware update engine for one device.
pub struct DfuEngine<T: DfuTransport> {
    device: DeviceHandle<T>,
    events: EventBus,
    session: Option<TransferSession>,
    last_outcome: Option<SessionOutcome>,
}

impl<T: DfuTransport> DfuEngine<T> {
    pub fn new(device: DeviceHandle<T>) -> Self {
        Self {
            device,
            events: EventBus::new(),
            session: None,
            last_outcome: None,
        }
    }

    /// Wrap the engine for sharing between tasks.
    pub fn into_shared(self) -> SharedEngine<T> {
        Arc::new(Mutex::new(self))
    }

    pub fn device(&self) -> &DeviceHandle<T> {
        &self.device
    }

    pub fn subscribe(&mut self, observer: Box<dyn DfuObserver>) {
        self.events.subscribe(observer);
    }

    #[cfg(feature = "state-callback")]
    pub fn on_start<F>(&mut self, listener: F)
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        self.events.on_start(listener);
    }

    #[cfg(feature = "state-callback")]
    pub fn on_progress<F>(&mut self, listener: F)
    where
        F: FnMut(f32) -> anyhow::Result<()> + Send + 'static,
    {
        self.events.on_progress(listener);
    }

    #[cfg(feature = "state-callback")]
    pub fn on_end<F>(&mut self, listener: F)
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        self.events.on_end(listener);
    }

    #[cfg(feature = "state-callback")]
    pub fn on_error<F>(&mut self, listener: F)
    where
        F: FnMut(crate::error::ErrorCode) -> anyhow::Result<()> + Send + 'static,
    {
        self.events.on_error(listener);
    }

    pub fn phase(&self) -> DfuPhase {
        self.session.as_ref().map_or(DfuPhase::Idle, |s| s.phase)
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Outcome of the most recent finished session.
    pub fn last_outcome(&self) -> Option<SessionOutcome> {
        self.last_outcome
    }

    /// Fraction of the image accepted in the current session.
    pub fn progress(&self) -> Option<f32> {
        self.session.as_ref().map(TransferSession::progress)
    }

    fn reject_if_active(&self) -> Result<(), DfuError> {
        match &self.session {
            Some(session) => {
                warn!(phase = %session.phase, "Request rejected, session in progress");
                Err(DfuError::SessionActive {
                    phase: session.phase,
                })
            }
            None => Ok(()),
        }
    }

    /// Start a session with the bound image.
    ///
    /// Nothing touches the bus until the first `poll`.
    #[instrument(skip(self), fields(address = %format!("0x{:02X}", self.device.settings().address)))]
    pub fn begin(&mut self) -> Result<(), DfuError> {
        self.reject_if_active()?;
        let image = self.device.image().ok_or(DfuError::NoFirmware)?;
        let session = TransferSession::new(image.len(), self.device.settings().chunk_size);
        info!(
            version = %image.version(),
            size = image.len(),
            chunks = session.total_chunks(),
            "Firmware update requested"
        );
        self.session = Some(session);
        self.last_outcome = None;
        Ok(())
    }

    /// Run one step of the current session and return the phase after it.
    pub fn poll(&mut self) -> DfuPhase {
        let Some(session) = self.session.as_mut() else {
            return DfuPhase::Idle;
        };
        let (transport, settings, image) = self.device.parts_mut();
        let Some(image) = image else {
            warn!("Session without firmware image dropped");
            self.session = None;
            return DfuPhase::Idle;
        };

        let mut ctx = HandlerContext {
            transport,
            events: &mut self.events,
            session,
            image,
            settings,
        };
        match step(&mut ctx) {
            HandleResult::Continue => self.phase(),
            HandleResult::Finished(outcome) => {
                info!(?outcome, "Session finished");
                self.session = None;
                self.last_outcome = Some(outcome);
                DfuPhase::Idle
            }
        }
    }

    /// Request cancellation at the next chunk boundary.
    ///
    /// Returns `false` when no session is running or it is past the point of
    /// no return (verifying or committing).
    pub fn cancel(&mut self) -> bool {
        match self.session.as_mut() {
            Some(session) if session.phase.is_cancellable() => {
                info!(offset = session.cursor, "Cancel requested");
                session.cancel_requested = true;
                true
            }
            Some(session) => {
                debug!(phase = %session.phase, "Cancel ignored");
                false
            }
            None => false,
        }
    }

    /// Poll until the machine is back in `Idle`.
    pub fn run_to_completion(&mut self) -> Option<SessionOutcome> {
        while self.is_active() {
            self.poll();
        }
        self.last_outcome
    }

    /// Start a session and run it to the end.
    pub fn flash(&mut self) -> Result<SessionOutcome, DfuError> {
        self.begin()?;
        Ok(self
            .run_to_completion()
            .unwrap_or(SessionOutcome::Completed))
    }

    /// Read the version the peripheral is running.
    pub fn running_version(&mut self) -> Result<Version, DfuError> {
        self.reject_if_active()?;
        let (transport, _, _) = self.device.parts_mut();
        Ok(transport.read_version()?)
    }

    /// Reset the peripheral, read its version and start an update when it
    /// differs from the bundled image.
    #[instrument(skip(self))]
    pub fn setup(&mut self) -> Result<SetupOutcome, DfuError> {
        self.reject_if_active()?;
        let (transport, _, image) = self.device.parts_mut();
        transport.reset()?;
        let running = transport.read_version()?;
        info!(version = %running, "Peripheral firmware version");

        let Some(target) = image.map(|i| i.version()) else {
            return Ok(SetupOutcome::NoFirmware(running));
        };
        if running == target {
            info!("Firmware up to date");
            return Ok(SetupOutcome::UpToDate(running));
        }

        info!(running = %running, target = %target, "Firmware out of date, updating");
        self.begin()?;
        Ok(SetupOutcome::UpdateStarted { running, target })
    }
}
