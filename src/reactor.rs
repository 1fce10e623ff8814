//! Single-threaded event loop: one socket multiplexer, one timing wheel.
//!
//! Everything in this crate runs on one thread, driven by a [`Reactor`].
//! Sockets register an [`EventSink`] for readiness events; delayed work goes
//! through [`schedule`](Reactor::schedule). Nothing may block: a "suspended"
//! operation is just stored state plus a registered interest or timer, and
//! it resumes when the loop calls back.
//!
//! Failure policy is deliberately fail-fast: component-level errors are
//! caught at the component boundary (see `tcp`), but a panic escaping a
//! sink or timer callback unwinds the loop. A corrupted socket or timer
//! table is not safely recoverable in-loop.

use crate::timer::{TimerHandle, TimingWheel};
use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Token};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

const TICK: Duration = Duration::from_millis(100);
const SLOTS: usize = 600;
const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ReactorError {
    /// Registration on a reactor that has shut down.
    #[error("reactor is closed")]
    Closed,

    /// The channel could not be registered with the multiplexer.
    #[error("channel registration failed: {0}")]
    Channel(#[source] io::Error),

    #[error("poll failed: {0}")]
    Io(#[from] io::Error),

    /// One or more channels failed to shut down cleanly; the loop still
    /// released everything it could before reporting.
    #[error("{} channel(s) failed to shut down cleanly", .0.len())]
    Shutdown(Vec<io::Error>),
}

/// Receiver of readiness events for one registered channel.
pub trait EventSink {
    /// Called when the channel has readiness to consume. The sink owns its
    /// socket and is free to re-register interests, schedule timers, or
    /// deregister itself through `reactor`.
    fn on_ready(&mut self, reactor: &mut Reactor, event: &Event);

    /// Called once during reactor shutdown; close the owned socket here.
    fn on_shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Callback fired when a scheduled delay elapses.
pub type TimerCallback = Box<dyn FnOnce(&mut Reactor)>;

/// The event loop. Owns the mio [`Poll`] and the [`TimingWheel`]; the sole
/// scheduler for both I/O readiness and delayed work.
pub struct Reactor {
    poll: Poll,
    wheel: TimingWheel<TimerCallback>,
    sinks: HashMap<Token, Rc<RefCell<dyn EventSink>>>,
    events: Option<Events>,
    next_token: usize,
    stopping: bool,
    closed: bool,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            wheel: TimingWheel::new(Instant::now(), TICK, SLOTS),
            sinks: HashMap::new(),
            events: Some(Events::with_capacity(EVENTS_CAPACITY)),
            next_token: 0,
            stopping: false,
            closed: false,
        })
    }

    /// Registers a channel and the sink that handles its readiness.
    pub fn register(
        &mut self,
        source: &mut impl Source,
        interests: Interest,
        sink: Rc<RefCell<dyn EventSink>>,
    ) -> Result<Token, ReactorError> {
        if self.closed {
            return Err(ReactorError::Closed);
        }
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(source, token, interests)
            .map_err(ReactorError::Channel)?;
        self.sinks.insert(token, sink);
        Ok(token)
    }

    /// Updates the interest set of an already-registered channel.
    pub fn reregister(
        &mut self,
        source: &mut impl Source,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.poll.registry().reregister(source, token, interests)
    }

    /// Removes a channel; its sink receives no further events.
    pub fn deregister(&mut self, source: &mut impl Source, token: Token) {
        self.sinks.remove(&token);
        if !self.closed {
            // The source may already be gone at the OS level; that is fine.
            let _ = self.poll.registry().deregister(source);
        }
    }

    /// Schedules `callback` to run after `delay`, rounded up to the next
    /// wheel tick. Returns `None` once the reactor is shutting down.
    ///
    /// # Panics
    ///
    /// Panics if `delay` is at or beyond the wheel horizon; that is a
    /// programming error, not a runtime condition.
    pub fn schedule(
        &mut self,
        delay: Duration,
        callback: impl FnOnce(&mut Reactor) + 'static,
    ) -> Option<TimerHandle> {
        if self.stopping {
            return None;
        }
        let handle = self
            .wheel
            .add(Instant::now(), delay, Box::new(callback) as TimerCallback)
            .expect("timer delay within wheel horizon");
        Some(handle)
    }

    /// Cancels a scheduled callback. Safe to call twice: the second call
    /// (or a call after firing) returns `false`.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        if self.stopping {
            return false;
        }
        self.wheel.cancel(handle).is_some()
    }

    /// Runs `task` every `period` (first run on the next tick) until it
    /// returns `false` or the reactor stops.
    pub fn interval(&mut self, period: Duration, task: impl FnMut(&mut Reactor) -> bool + 'static) {
        fn arm(
            reactor: &mut Reactor,
            delay: Duration,
            period: Duration,
            mut task: Box<dyn FnMut(&mut Reactor) -> bool>,
        ) {
            reactor.schedule(delay, move |r| {
                if task(r) {
                    arm(r, period, period, task);
                }
            });
        }
        arm(self, Duration::ZERO, period, Box::new(task));
    }

    /// Requests loop exit; resources are released when `run` returns.
    pub fn shutdown(&mut self) {
        self.stopping = true;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stopping
    }

    /// Runs until [`shutdown`](Self::shutdown), then closes every
    /// registered channel, aggregating close-time failures rather than
    /// bailing on the first.
    pub fn run(&mut self) -> Result<(), ReactorError> {
        debug!("reactor running");
        let outcome = loop {
            if self.stopping {
                break Ok(());
            }
            if let Err(e) = self.turn() {
                break Err(e);
            }
        };
        let closed = self.close();
        outcome.and(closed)
    }

    /// One loop iteration: fire due timers, poll with the time until the
    /// next timer as the wait bound, dispatch ready channels. Exposed so
    /// tests can drive the loop step by step.
    pub fn turn(&mut self) -> Result<(), ReactorError> {
        self.fire_timers();
        if self.stopping {
            return Ok(());
        }

        let max_wait = self.wheel.next_tick_in(Instant::now());
        let mut events = self
            .events
            .take()
            .unwrap_or_else(|| Events::with_capacity(EVENTS_CAPACITY));
        let polled = self.poll.poll(&mut events, Some(max_wait));

        let outcome = match polled {
            Ok(()) => {
                for event in events.iter() {
                    if self.stopping {
                        break;
                    }
                    // A sink dispatched earlier in this batch may have
                    // deregistered this one; skip stale tokens.
                    let Some(sink) = self.sinks.get(&event.token()).map(Rc::clone) else {
                        trace!(token = event.token().0, "event for stale token");
                        continue;
                    };
                    sink.borrow_mut().on_ready(self, event);
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e.into()),
        };
        self.events = Some(events);
        outcome
    }

    fn fire_timers(&mut self) {
        self.wheel.tick(Instant::now());
        for callback in self.wheel.take_ready() {
            if self.stopping {
                return;
            }
            callback(self);
        }
    }

    fn close(&mut self) -> Result<(), ReactorError> {
        if self.closed {
            return Ok(());
        }
        self.stopping = true;
        self.closed = true;
        self.wheel.clear();

        let mut failures = Vec::new();
        for (_, sink) in self.sinks.drain() {
            // A sink still borrowed is mid-dispatch on this very stack; it
            // is dropped with its Rc instead of being shut down twice.
            if let Ok(mut sink) = sink.try_borrow_mut() {
                if let Err(e) = sink.on_shutdown() {
                    failures.push(e);
                }
            }
        }
        debug!(failures = failures.len(), "reactor closed");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ReactorError::Shutdown(failures))
        }
    }
}
