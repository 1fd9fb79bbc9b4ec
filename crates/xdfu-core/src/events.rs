//! Event system for DFU lifecycle notifications.
//!
//! Listeners are registered per event kind and invoked synchronously, in
//! registration order, from inside the state machine's transitions. They
//! receive values only. A listener that fails or panics is logged and skipped;
//! the transfer carries on.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, error, info, warn};

use crate::error::ErrorCode;

/// Lifecycle event of a DFU session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DfuEvent {
    /// The peripheral entered DFU mode and the transfer begins.
    Start,
    /// Fraction of the image accepted by the peripheral, in `[0, 1]`.
    Progress(f32),
    /// The new image was committed and is running.
    End,
    /// The session was aborted.
    Error(ErrorCode),
}

/// Discriminant of a [`DfuEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Progress,
    End,
    Error,
}

impl DfuEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DfuEvent::Start => EventKind::Start,
            DfuEvent::Progress(_) => EventKind::Progress,
            DfuEvent::End => EventKind::End,
            DfuEvent::Error(_) => EventKind::Error,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Start => write!(f, "start"),
            EventKind::Progress => write!(f, "progress"),
            EventKind::End => write!(f, "end"),
            EventKind::Error => write!(f, "error"),
        }
    }
}

/// Observer trait for receiving every DFU event.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DfuObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DfuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DfuObserver for TracingObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::Start => info!("DFU started"),
            DfuEvent::Progress(fraction) => {
                debug!(progress = %format!("{:.1}%", fraction * 100.0), "DFU progress");
            }
            DfuEvent::End => info!("DFU complete"),
            DfuEvent::Error(code) => {
                error!(code = code.as_u8(), "DFU failed: {}", code);
            }
        }
    }
}

#[cfg(feature = "state-callback")]
type Listener = Box<dyn FnMut(&DfuEvent) -> anyhow::Result<()> + Send>;

/// Per-kind listener registry.
#[derive(Default)]
pub struct EventBus {
    #[cfg(feature = "state-callback")]
    start: Vec<Listener>,
    #[cfg(feature = "state-callback")]
    progress: Vec<Listener>,
    #[cfg(feature = "state-callback")]
    end: Vec<Listener>,
    #[cfg(feature = "state-callback")]
    error: Vec<Listener>,
    observers: Vec<Box<dyn DfuObserver>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event.
    pub fn subscribe(&mut self, observer: Box<dyn DfuObserver>) {
        self.observers.push(observer);
    }

    #[cfg(feature = "state-callback")]
    pub fn on_start<F>(&mut self, mut listener: F)
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        self.start.push(Box::new(move |_: &DfuEvent| listener()));
    }

    #[cfg(feature = "state-callback")]
    pub fn on_progress<F>(&mut self, mut listener: F)
    where
        F: FnMut(f32) -> anyhow::Result<()> + Send + 'static,
    {
        self.progress.push(Box::new(move |event: &DfuEvent| match event {
            DfuEvent::Progress(fraction) => listener(*fraction),
            _ => Ok(()),
        }));
    }

    #[cfg(feature = "state-callback")]
    pub fn on_end<F>(&mut self, mut listener: F)
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        self.end.push(Box::new(move |_: &DfuEvent| listener()));
    }

    #[cfg(feature = "state-callback")]
    pub fn on_error<F>(&mut self, mut listener: F)
    where
        F: FnMut(ErrorCode) -> anyhow::Result<()> + Send + 'static,
    {
        self.error.push(Box::new(move |event: &DfuEvent| match event {
            DfuEvent::Error(code) => listener(*code),
            _ => Ok(()),
        }));
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        #[cfg(feature = "state-callback")]
        {
            match kind {
                EventKind::Start => self.start.len(),
                EventKind::Progress => self.progress.len(),
                EventKind::End => self.end.len(),
                EventKind::Error => self.error.len(),
            }
        }
        #[cfg(not(feature = "state-callback"))]
        {
            let _ = kind;
            0
        }
    }

    /// Deliver `event` to observers and to the listeners of its kind.
    pub fn dispatch(&mut self, event: DfuEvent) {
        TracingObserver.on_event(&event);
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))).is_err() {
                warn!(kind = %event.kind(), "Observer panicked");
            }
        }

        #[cfg(feature = "state-callback")]
        {
            let kind = event.kind();
            let listeners = match kind {
                EventKind::Start => &mut self.start,
                EventKind::Progress => &mut self.progress,
                EventKind::End => &mut self.end,
                EventKind::Error => &mut self.error,
            };
            for (index, listener) in listeners.iter_mut().enumerate() {
                match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(kind = %kind, index, error = %e, "Listener failed"),
                    Err(_) => warn!(kind = %kind, index, "Listener panicked"),
                }
            }
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("start", &self.listener_count(EventKind::Start))
            .field("progress", &self.listener_count(EventKind::Progress))
            .field("end", &self.listener_count(EventKind::End))
            .field("error", &self.listener_count(EventKind::Error))
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(all(test, feature = "state-callback"))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_listeners_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        for id in 0..3 {
            let log = Arc::clone(&log);
            bus.on_start(move || {
                log.lock().unwrap().push(id);
                Ok(())
            });
        }
        bus.dispatch(DfuEvent::Start);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_dispatch_only_reaches_matching_kind() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        let s = Arc::clone(&seen);
        bus.on_progress(move |x| {
            s.lock().unwrap().push(x);
            Ok(())
        });
        let s = Arc::clone(&seen);
        bus.on_error(move |code| {
            s.lock().unwrap().push(-(code.as_u8() as f32));
            Ok(())
        });
        bus.dispatch(DfuEvent::Start);
        bus.dispatch(DfuEvent::Progress(0.5));
        bus.dispatch(DfuEvent::Progress(0.5));
        bus.dispatch(DfuEvent::Error(ErrorCode::Timeout));
        assert_eq!(*seen.lock().unwrap(), vec![0.5, 0.5, -2.0]);
    }

    #[test]
    fn test_failing_listener_is_isolated() {
        let count = Arc::new(Mutex::new(0));
        let mut bus = EventBus::new();
        bus.on_end(|| anyhow::bail!("listener broke"));
        bus.on_end(|| panic!("listener panicked"));
        let c = Arc::clone(&count);
        bus.on_end(move || {
            *c.lock().unwrap() += 1;
            Ok(())
        });
        bus.dispatch(DfuEvent::End);
        bus.dispatch(DfuEvent::End);
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn test_observer_sees_every_event() {
        struct Recorder(Arc<Mutex<Vec<EventKind>>>);
        impl DfuObserver for Recorder {
            fn on_event(&self, event: &DfuEvent) {
                self.0.lock().unwrap().push(event.kind());
            }
        }
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();
        bus.subscribe(Box::new(Recorder(Arc::clone(&kinds))));
        bus.dispatch(DfuEvent::Start);
        bus.dispatch(DfuEvent::End);
        assert_eq!(*kinds.lock().unwrap(), vec![EventKind::Start, EventKind::End]);
    }

    #[test]
    fn test_listener_count() {
        let mut bus = EventBus::new();
        assert_eq!(bus.listener_count(EventKind::Error), 0);
        bus.on_error(|_| Ok(()));
        bus.on_error(|_| Ok(()));
        assert_eq!(bus.listener_count(EventKind::Error), 2);
        assert_eq!(bus.listener_count(EventKind::Start), 0);
    }
}
