//! Single-threaded readiness loop.
//!
//! One [`EventLoop`] owns a poller and the [`ConnectionRegistry`] of sockets
//! subscribed to it. Each turn blocks until something is ready, turns the
//! ready set into [`ReadinessEvent`]s and hands them to a [`Dispatcher`] one
//! at a time. The server and the client receive loop are both dispatchers.

use std::{io, sync::Arc, time::Duration};

use mio::{Events, Poll, Token, Waker, event::Event};
use tracing::{debug, trace, warn};

use crate::registry::{ConnectionRegistry, LISTENER, WAKER};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// What became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessEvent {
    /// The listening socket has connections waiting to be accepted.
    Acceptable,
    /// A client connection has bytes to read, or has closed.
    Readable(Token),
}

impl ReadinessEvent {
    fn classify(event: &Event) -> Self {
        match event.token() {
            LISTENER => Self::Acceptable,
            token => Self::Readable(token),
        }
    }
}

/// Whether the loop should keep waiting after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Handles readiness events on the loop thread.
pub trait Dispatcher {
    fn dispatch(
        &mut self,
        registry: &mut ConnectionRegistry,
        event: ReadinessEvent,
    ) -> io::Result<Flow>;
}

/// Counters that let an operator see the loop is alive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub iterations: u64,
    pub spurious_wakeups: u64,
    pub handler_errors: u64,
}

/// Result of a single wait-and-dispatch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    /// Woke up with nothing to do.
    Spurious,
    Handled { events: usize, flow: Flow },
}

/// Wakes a running [`EventLoop`] from another thread and makes it return.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    registry: ConnectionRegistry,
    waker: Option<Arc<Waker>>,
    stats: LoopStats,
}

impl EventLoop {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = ConnectionRegistry::new(poll.registry().try_clone()?);
        Ok(Self {
            poll,
            events: Events::with_capacity(event_capacity.max(1)),
            registry,
            waker: None,
            stats: LoopStats::default(),
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ConnectionRegistry {
        &mut self.registry
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn shutdown_handle(&mut self) -> io::Result<ShutdownHandle> {
        let waker = match &self.waker {
            Some(waker) => Arc::clone(waker),
            None => {
                let waker = Arc::new(Waker::new(self.poll.registry(), WAKER)?);
                self.waker = Some(Arc::clone(&waker));
                waker
            }
        };
        Ok(ShutdownHandle { waker })
    }

    /// Runs until the dispatcher or a [`ShutdownHandle`] asks to stop.
    ///
    /// Errors from handling individual events are logged and swallowed. Only
    /// a failure of the readiness wait itself ends the loop with an error.
    pub fn run<D>(&mut self, dispatcher: &mut D) -> io::Result<()>
    where
        D: Dispatcher + ?Sized,
    {
        let result = loop {
            match self.turn(dispatcher, None) {
                Ok(Turn::Handled {
                    flow: Flow::Stop, ..
                }) => break Ok(()),
                Ok(_) => {}
                Err(err) => break Err(err),
            }
        };
        debug!(stats = ?self.stats, "event loop finished");
        result
    }

    /// Waits once for readiness and dispatches whatever became ready.
    ///
    /// `timeout` of `None` blocks until at least one handle is ready.
    pub fn turn<D>(&mut self, dispatcher: &mut D, timeout: Option<Duration>) -> io::Result<Turn>
    where
        D: Dispatcher + ?Sized,
    {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                return Ok(self.spurious_wakeup());
            }
            Err(err) => return Err(err),
        }

        // Platforms may wake the poller with an empty set.
        if self.events.is_empty() {
            return Ok(self.spurious_wakeup());
        }

        let mut stop = false;
        let ready: Vec<ReadinessEvent> = self
            .events
            .iter()
            .filter(|event| {
                if event.token() == WAKER {
                    stop = true;
                    return false;
                }
                true
            })
            .map(ReadinessEvent::classify)
            .collect();

        self.stats.iterations += 1;

        for event in ready.iter().copied() {
            match dispatcher.dispatch(&mut self.registry, event) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => stop = true,
                Err(err) => {
                    self.stats.handler_errors += 1;
                    warn!(
                        ?event,
                        error = ?err,
                        handler_errors = self.stats.handler_errors,
                        "event handling failed; loop keeps running"
                    );
                }
            }
        }

        let flow = if stop { Flow::Stop } else { Flow::Continue };
        Ok(Turn::Handled {
            events: ready.len(),
            flow,
        })
    }

    fn spurious_wakeup(&mut self) -> Turn {
        self.stats.spurious_wakeups += 1;
        trace!(
            spurious_wakeups = self.stats.spurious_wakeups,
            "woke with no ready handles"
        );
        Turn::Spurious
    }
}
