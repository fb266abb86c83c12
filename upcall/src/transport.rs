//! Synchronous command transport between many callers and one consumer.
//!
//! Callers [`submit`](Transport::submit) a [`Request`] and block until the
//! consumer answers, a staged deadline passes, the caller is interrupted, or
//! the transport shuts down. The consumer drives the other end through a
//! [`ConsumerChannel`], pulling framed commands and pushing replies.
//!
//! # Example
//!
//! ```no_run
//! use std::thread;
//! use upcall::{Request, Timeout, Transport, TransportConfig};
//!
//! let transport = Transport::new(TransportConfig::default())?;
//! let mut consumer = transport.attach()?;
//!
//! thread::scope(|s| {
//!     s.spawn(|| {
//!         let frame = consumer.pull(4096, Timeout::Infinite).unwrap().unwrap();
//!         consumer.complete(frame.id(), b"PONG");
//!     });
//!     let reply = transport.submit(Request::new(b"PING".to_vec())).unwrap();
//!     assert_eq!(reply.payload, b"PONG");
//! });
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Locking
//!
//! Locks are taken in the order work, set, command, wheel. No lock is held
//! while blocking on another thread, and command holds are never released
//! under a command or wheel lock.

mod command;
mod config;
mod consumer;
mod error;
mod interrupt;
mod pending;
mod sequence;
mod stats;
mod supervisor;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::codec::{self, CallError, Wire};
use crate::region::{Direction, Region};
use crate::trace::{debug, error, info, trace, warn};

pub use command::Status;
pub use config::{ConfigError, MAX_STAGE, TimeoutConfig, TransportConfig};
pub use consumer::{ConsumerChannel, PushOutcome, Pulled, PulledFrame, Timeout};
pub use error::{AttachError, PullError, SubmitError, TransportError};
pub use interrupt::Interrupt;
pub use sequence::{CommandId, SequenceAllocator};
pub use stats::TransportStats;

use command::PendingCommand;
use pending::{CommandRef, PendingSet};
use stats::Counters;
use supervisor::Supervisor;

/// A command to submit.
#[derive(Debug, Clone)]
pub struct Request {
    outbound: Vec<u8>,
    scatter_out: Vec<Region>,
    scatter_in: Vec<Region>,
    interrupt: Option<Interrupt>,
    first_stage: Option<Duration>,
}

impl Request {
    /// A command with body `outbound` and no bulk regions.
    #[must_use]
    pub const fn new(outbound: Vec<u8>) -> Self {
        Self {
            outbound,
            scatter_out: Vec::new(),
            scatter_in: Vec::new(),
            interrupt: None,
            first_stage: None,
        }
    }

    /// Appends regions the consumer reads after the body, in order.
    ///
    /// Each region still joins the list matching its own direction, so a
    /// [`Direction::FromConsumer`] region here lands in `scatter_in`.
    #[must_use]
    pub fn scatter_out(self, regions: Vec<Region>) -> Self {
        regions.into_iter().fold(self, Self::region)
    }

    /// Appends regions the reply fills, in order.
    ///
    /// A [`Direction::ToConsumer`] region is routed to `scatter_out` and is
    /// never overwritten by the reply.
    #[must_use]
    pub fn scatter_in(self, regions: Vec<Region>) -> Self {
        regions.into_iter().fold(self, Self::region)
    }

    /// Appends one region to the list matching its direction.
    #[must_use]
    pub fn region(mut self, region: Region) -> Self {
        match region.direction() {
            Direction::ToConsumer => self.scatter_out.push(region),
            Direction::FromConsumer => self.scatter_in.push(region),
        }
        self
    }

    /// Lets `interrupt` abandon the wait for this command.
    #[must_use]
    pub fn interruptible(mut self, interrupt: &Interrupt) -> Self {
        self.interrupt = Some(interrupt.clone());
        self
    }

    /// Overrides the first stage budget for this command only.
    ///
    /// The budget is clamped below the configured second stage.
    #[must_use]
    pub fn first_stage_timeout(mut self, budget: Duration) -> Self {
        self.first_stage = Some(budget);
        self
    }
}

/// The consumer's answer to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply bytes that did not land in `scatter_in` regions.
    pub payload: Vec<u8>,
    /// Reply bytes written into `scatter_in` regions.
    pub scattered: usize,
}

/// State shared by the transport handle, the consumer channel and the timer
/// thread.
pub(crate) struct Shared {
    config: TransportConfig,
    seq: SequenceAllocator,
    pending: Arc<PendingSet>,
    supervisor: Supervisor,
    counters: Counters,
    /// Attached consumer session; zero when detached.
    session: AtomicU64,
    next_session: AtomicU64,
    shutdown: AtomicBool,
    /// Guards the admission check against lost wakeups.
    work: Mutex<()>,
    work_ready: Condvar,
    waker: Mutex<Option<Arc<mio::Waker>>>,
}

impl Shared {
    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn is_session(&self, session: u64) -> bool {
        self.session.load(Ordering::SeqCst) == session
    }

    fn is_attached(&self) -> bool {
        self.session.load(Ordering::SeqCst) != 0
    }

    /// Wakes a blocked pull and the registered readiness waker.
    fn signal_work(&self) {
        {
            let _work = self.work.lock();
            self.work_ready.notify_all();
        }
        if let Some(waker) = self.waker.lock().as_ref() {
            if let Err(_e) = waker.wake() {
                warn!(error = %_e, "failed to wake consumer poll");
            }
        }
    }

    /// Resolves `cmd` with `status` unless it already resolved.
    fn force(&self, cmd: &CommandRef, status: Status) -> bool {
        let timer = {
            let mut st = cmd.lock();
            if st.status().is_terminal() {
                return false;
            }
            cmd.finish(&mut st, status)
        };
        if let Some(timer) = timer {
            self.supervisor.cancel(timer);
        }
        true
    }

    /// Resolves every unresolved command with `status`; returns how many.
    fn resolve_all(&self, status: Status) -> u64 {
        let mut resolved = 0;
        for cmd in self.pending.snapshot() {
            if self.force(&cmd, status) {
                resolved += 1;
            }
        }
        resolved
    }

    /// Detaches `session` (or whichever consumer is attached when `None`) and
    /// drains in-flight work. Returns the number of commands drained.
    fn detach(&self, session: Option<u64>) -> u64 {
        let detached = match session {
            Some(session) => self
                .session
                .compare_exchange(session, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok(),
            None => self.session.swap(0, Ordering::SeqCst) != 0,
        };
        if !detached {
            return 0;
        }
        let drained = self.resolve_all(Status::TimedOut);
        Counters::add(&self.counters.drained, drained);
        info!(drained, "consumer detached");
        self.signal_work();
        drained
    }
}

/// Handle to a running transport.
///
/// Dropping the handle shuts the transport down, cancelling every command
/// still in flight; see [`Transport::close`].
pub struct Transport {
    shared: Arc<Shared>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Validates `config` and starts the timer thread.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] if the configuration is
    /// invalid and [`TransportError::Spawn`] if the timer thread cannot start.
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let slots = config.validate()?;
        info!(
            name = %config.name,
            t1_ms = config.timeouts.first_stage.as_millis() as u64,
            t2_ms = config.timeouts.second_stage.as_millis() as u64,
            t3_ms = config.timeouts.third_stage.as_millis() as u64,
            tick_us = config.timeouts.tick.as_micros() as u64,
            wheel_slots = slots.get(),
            "transport starting"
        );

        let shared = Arc::new(Shared {
            supervisor: Supervisor::new(slots, config.timeouts.tick),
            seq: SequenceAllocator::new(),
            pending: Arc::new(PendingSet::new()),
            counters: Counters::default(),
            session: AtomicU64::new(0),
            next_session: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            work: Mutex::new(()),
            work_ready: Condvar::new(),
            waker: Mutex::new(None),
            config,
        });

        debug!("spawning timer thread");
        let timer_shared = Arc::clone(&shared);
        let timer = thread::Builder::new()
            .name(format!("{}-timer", shared.config.name))
            .spawn(move || {
                info!("timer thread started");
                timer_shared.supervisor.run(&timer_shared.counters);
                info!("timer thread exiting");
            })
            .map_err(TransportError::Spawn)?;

        Ok(Self {
            shared,
            timer: Mutex::new(Some(timer)),
        })
    }

    /// The configuration this transport was built with.
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Attaches the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`AttachError::AlreadyAttached`] while another channel is
    /// live, and [`AttachError::Shutdown`] after [`Transport::close`].
    pub fn attach(&self) -> Result<ConsumerChannel, AttachError> {
        let shared = &self.shared;
        if shared.is_shut_down() {
            return Err(AttachError::Shutdown);
        }
        let session = shared.next_session.fetch_add(1, Ordering::Relaxed);
        shared
            .session
            .compare_exchange(0, session, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| AttachError::AlreadyAttached)?;
        info!(session, "consumer attached");
        Ok(ConsumerChannel::new(Arc::clone(shared), session))
    }

    /// Forces the current consumer off, as when its process goes away.
    ///
    /// Every unresolved command times out and a blocked pull returns
    /// [`PullError::Detached`]. Returns the number of commands drained.
    pub fn on_consumer_detached(&self) -> u64 {
        self.shared.detach(None)
    }

    #[must_use]
    pub fn is_consumer_attached(&self) -> bool {
        self.shared.is_attached()
    }

    /// Whether a command is queued and not yet pulled.
    #[must_use]
    pub fn has_admissible_work(&self) -> bool {
        self.shared.pending.has_admissible()
    }

    /// Commands held in the pending set, resolved ones included until their
    /// last holder lets go.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }

    #[must_use]
    pub fn stats(&self) -> TransportStats {
        self.shared.counters.snapshot(
            self.shared.pending.len(),
            self.shared.supervisor.high_water(),
        )
    }

    /// Submits a command and blocks until it resolves.
    ///
    /// # Errors
    ///
    /// - [`SubmitError::NoConsumer`] if no consumer is attached; nothing is queued.
    /// - [`SubmitError::Timeout`] if a stage deadline passes or the consumer detaches.
    /// - [`SubmitError::Interrupted`] if the request's interrupt fires.
    /// - [`SubmitError::Cancelled`] if the transport shuts down.
    pub fn submit(&self, request: Request) -> Result<Reply, SubmitError> {
        let shared = &self.shared;
        if shared.is_shut_down() {
            return Err(SubmitError::Cancelled);
        }
        if !shared.is_attached() {
            Counters::bump(&shared.counters.rejected);
            debug!("submit rejected: no consumer");
            return Err(SubmitError::NoConsumer);
        }

        let Request {
            outbound,
            scatter_out,
            scatter_in,
            interrupt,
            first_stage,
        } = request;
        let id = shared.seq.next();
        let caller = shared.pending.insert(PendingCommand::new(
            id,
            outbound,
            scatter_out,
            scatter_in,
        ));
        Counters::bump(&shared.counters.submitted);
        if let Some(interrupt) = &interrupt {
            interrupt.register(caller.command());
        }
        shared.supervisor.arm(
            &caller,
            Status::Sending,
            shared.config.timeouts.first_stage_for(first_stage),
        );
        trace!(%id, len = caller.outbound().len(), "command submitted");
        shared.signal_work();

        // Lost a race with detach or shutdown: their drain may have missed us.
        if !shared.is_attached() && shared.force(&caller, Status::TimedOut) {
            Counters::bump(&shared.counters.drained);
        }
        if shared.is_shut_down() && shared.force(&caller, Status::Cancelled) {
            Counters::bump(&shared.counters.cancelled);
        }

        let outcome = Self::wait(&caller);
        if matches!(outcome, Err(SubmitError::Interrupted)) {
            Counters::bump(&shared.counters.interrupted);
            debug!(%id, "submit interrupted");
        }
        outcome
    }

    fn wait(caller: &CommandRef) -> Result<Reply, SubmitError> {
        let mut st = caller.lock();
        loop {
            match st.status() {
                Status::Done => {
                    return Ok(Reply {
                        payload: std::mem::take(&mut st.inbound),
                        scattered: st.scattered,
                    });
                }
                Status::TimedOut => return Err(SubmitError::Timeout),
                Status::Cancelled => return Err(SubmitError::Cancelled),
                _ if st.interrupted => return Err(SubmitError::Interrupted),
                _ => caller.wait(&mut st),
            }
        }
    }

    /// Encodes `req`, submits it, and decodes the reply body as `Resp`.
    ///
    /// `options` supplies regions, an interrupt or a stage override; its body
    /// is replaced by the encoded request.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Submit`] if the submit fails and
    /// [`CallError::Codec`] if either side fails to (de)serialize.
    pub fn call<Req: Wire, Resp: Wire>(
        &self,
        req: &Req,
        options: Request,
    ) -> Result<Resp, CallError> {
        let request = Request {
            outbound: codec::encode(req)?,
            ..options
        };
        let reply = self.submit(request)?;
        Ok(codec::decode(&reply.payload)?)
    }

    /// Shuts the transport down without waiting for the handle to drop.
    ///
    /// Every unresolved command is cancelled, new submits fail with
    /// [`SubmitError::Cancelled`], the consumer's pulls return
    /// [`PullError::Shutdown`], and the timer thread is joined.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(name = %shared.config.name, "transport shutdown initiated");

        shared.supervisor.stop();
        let timer = self.timer.lock().take();
        if let Some(handle) = timer {
            debug!("waiting for timer thread to exit");
            if handle.join().is_err() {
                error!("timer thread panicked");
            }
        }

        let cancelled = shared.resolve_all(Status::Cancelled);
        Counters::add(&shared.counters.cancelled, cancelled);
        shared.supervisor.drain();
        shared.signal_work();
        info!(cancelled, "transport shutdown complete");
    }

    /// Shuts the transport down; see [`Transport::close`].
    pub fn shutdown(self) {
        self.close();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.shared.config.name)
            .field("attached", &self.is_consumer_attached())
            .field("pending", &self.pending_len())
            .finish()
    }
}
