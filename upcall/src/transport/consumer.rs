//! The consumer's end of the transport.
//!
//! A [`ConsumerChannel`] pulls framed commands out of the pending set and
//! pushes replies back in. Only one channel is attached at a time; dropping
//! it detaches the consumer and drains everything still in flight.

use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;

use crate::protocol::{self, FrameHeader, FrameKind, HEADER_SIZE, ProtocolError, ReplyFrame};
use crate::region::{gather, scatter};
use crate::trace::{debug, trace};
use crate::transport::command::Status;
use crate::transport::error::PullError;
use crate::transport::pending::CommandRef;
use crate::transport::sequence::CommandId;
use crate::transport::stats::Counters;
use crate::transport::Shared;

/// Timeout specification for blocking pulls.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration. [`Duration::ZERO`] polls.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Where [`ConsumerChannel::pull_into`] put a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulled {
    pub id: CommandId,
    pub kind: FrameKind,
    /// Bytes written to the buffer, header included.
    pub len: usize,
    /// Further continuation frames follow for this command.
    pub more: bool,
}

/// An owned pulled frame, from [`ConsumerChannel::pull`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledFrame {
    header: FrameHeader,
    bytes: Vec<u8>,
}

impl PulledFrame {
    #[must_use]
    pub const fn header(&self) -> &FrameHeader {
        &self.header
    }

    #[must_use]
    pub const fn id(&self) -> CommandId {
        self.header.id
    }

    /// Frame payload after the header.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..]
    }

    /// The whole frame, header included.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// What a pushed frame did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The command moved to `Acked`.
    Acked,
    /// The reply was delivered and the caller woken.
    Completed,
    /// Unknown id, already resolved, or an ack in the wrong state.
    Ignored,
}

/// Exclusive consumer handle, returned by [`Transport::attach`](crate::Transport::attach).
pub struct ConsumerChannel {
    shared: Arc<Shared>,
    session: u64,
    /// A command whose scatter regions did not all fit in one frame.
    continuation: Option<CommandRef>,
}

impl ConsumerChannel {
    pub(crate) const fn new(shared: Arc<Shared>, session: u64) -> Self {
        Self {
            shared,
            session,
            continuation: None,
        }
    }

    fn check_live(&self) -> Result<(), PullError> {
        if self.shared.is_shut_down() {
            return Err(PullError::Shutdown);
        }
        if !self.shared.is_session(self.session) {
            return Err(PullError::Detached);
        }
        Ok(())
    }

    /// Whether this channel is still the attached consumer.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        !self.shared.is_shut_down() && self.shared.is_session(self.session)
    }

    /// Whether a pull would return a frame without blocking.
    #[must_use]
    pub fn poll_ready(&self) -> bool {
        self.continuation
            .as_ref()
            .is_some_and(|cmd| !cmd.status().is_terminal())
            || self.shared.pending.has_admissible()
    }

    /// Registers a mio waker to be woken whenever new work is queued.
    ///
    /// Replaces any previous waker. The waker is also woken on detach and
    /// shutdown so a poll loop can notice.
    pub fn set_waker(&self, waker: Arc<mio::Waker>) {
        *self.shared.waker.lock() = Some(waker);
    }

    /// Pulls the next frame into `buf`.
    ///
    /// Returns `Ok(None)` if nothing arrived before `timeout`.
    ///
    /// # Errors
    ///
    /// - [`PullError::BufferTooSmall`] if the next frame cannot fit; the
    ///   command is left queued and can be pulled with a larger buffer.
    /// - [`PullError::Detached`] if this channel is no longer attached.
    /// - [`PullError::Shutdown`] if the transport shut down.
    pub fn pull_into(
        &mut self,
        buf: &mut [u8],
        timeout: Timeout,
    ) -> Result<Option<Pulled>, PullError> {
        self.check_live()?;
        if let Some(pulled) = self.resume(buf)? {
            return Ok(Some(pulled));
        }
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            let Some(cmd) = self.wait_for_work(deadline)? else {
                return Ok(None);
            };
            if let Some(pulled) = self.deliver(&cmd, buf)? {
                if pulled.more {
                    self.continuation = Some(cmd);
                }
                return Ok(Some(pulled));
            }
        }
    }

    /// Allocating variant of [`ConsumerChannel::pull_into`] with a buffer of
    /// `max_bytes`.
    ///
    /// # Errors
    ///
    /// As [`ConsumerChannel::pull_into`].
    pub fn pull(
        &mut self,
        max_bytes: usize,
        timeout: Timeout,
    ) -> Result<Option<PulledFrame>, PullError> {
        let mut bytes = vec![0; max_bytes];
        let Some(pulled) = self.pull_into(&mut bytes, timeout)? else {
            return Ok(None);
        };
        bytes.truncate(pulled.len);
        let header = protocol::decode_header(&bytes)?;
        Ok(Some(PulledFrame { header, bytes }))
    }

    /// Blocks until a `Sending` command is available, holding it on return.
    fn wait_for_work(&self, deadline: Option<Instant>) -> Result<Option<CommandRef>, PullError> {
        let shared = &self.shared;
        let mut work = shared.work.lock();
        loop {
            self.check_live()?;
            if let Some(cmd) = shared.pending.next_admissible() {
                return Ok(Some(cmd));
            }
            match deadline {
                None => shared.work_ready.wait(&mut work),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    shared
                        .work_ready
                        .wait_for(&mut work, deadline.saturating_duration_since(now));
                }
            }
        }
    }

    /// Copies the start frame of a freshly admitted command into `buf`.
    ///
    /// Returns `Ok(None)` if the command resolved while being copied.
    fn deliver(&self, cmd: &CommandRef, buf: &mut [u8]) -> Result<Option<Pulled>, PullError> {
        let outbound = cmd.outbound();
        let body_start = HEADER_SIZE + outbound.len();
        let room = frame_room(buf);
        if body_start > room {
            return Err(PullError::BufferTooSmall {
                need: body_start,
                have: room,
            });
        }
        buf[HEADER_SIZE..body_start].copy_from_slice(outbound);
        let (written, copied) = gather(cmd.scatter_out(), &mut buf[body_start..room]);
        let len = body_start + written;
        let more = copied < cmd.scatter_out().len();
        protocol::write_header(buf, FrameKind::Command, cmd.id(), len, more)?;

        if !self.shared.pending.mark_handling(cmd) {
            trace!(id = %cmd.id(), "command resolved during pull; discarding copy");
            return Ok(None);
        }
        cmd.lock().cursor = copied;
        self.shared.supervisor.arm(
            cmd,
            Status::Handling,
            self.shared.config.timeouts.second_stage,
        );
        debug!(id = %cmd.id(), len, regions = copied, more, "command pulled");
        Ok(Some(Pulled {
            id: cmd.id(),
            kind: FrameKind::Command,
            len,
            more,
        }))
    }

    /// Continues streaming the scatter regions of a partially pulled command.
    fn resume(&mut self, buf: &mut [u8]) -> Result<Option<Pulled>, PullError> {
        let Some(cmd) = self.continuation.take() else {
            return Ok(None);
        };
        let pulled = {
            let mut st = cmd.lock();
            if st.status().is_terminal() {
                None
            } else {
                let rest = &cmd.scatter_out()[st.cursor..];
                let need = HEADER_SIZE + rest.first().map_or(0, |r| r.len());
                let room = frame_room(buf);
                if need > room {
                    drop(st);
                    self.continuation = Some(cmd);
                    return Err(PullError::BufferTooSmall { need, have: room });
                }
                let (written, copied) = gather(rest, &mut buf[HEADER_SIZE..room]);
                st.cursor += copied;
                let len = HEADER_SIZE + written;
                let more = st.cursor < cmd.scatter_out().len();
                protocol::write_header(buf, FrameKind::Continuation, cmd.id(), len, more)?;
                Some(Pulled {
                    id: cmd.id(),
                    kind: FrameKind::Continuation,
                    len,
                    more,
                })
            }
        };
        match pulled {
            Some(pulled) => {
                trace!(id = %pulled.id, len = pulled.len, more = pulled.more, "continuation pulled");
                if pulled.more {
                    self.continuation = Some(cmd);
                }
                Ok(Some(pulled))
            }
            None => Ok(None),
        }
    }

    /// Handles a frame written by the consumer.
    ///
    /// An 8-byte frame is a bare acknowledgment; anything longer is a reply.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BufferTooSmall`] for frames shorter than the
    /// command id.
    pub fn push(&self, frame: &[u8]) -> Result<PushOutcome, ProtocolError> {
        Ok(match protocol::decode_reply(frame)? {
            ReplyFrame::Ack(id) => self.ack(id),
            ReplyFrame::Data { id, payload } => self.complete(id, payload),
        })
    }

    /// Acknowledges a pulled command, extending its deadline to the third stage.
    pub fn ack(&self, id: CommandId) -> PushOutcome {
        if !self.is_attached() {
            return PushOutcome::Ignored;
        }
        let Some(cmd) = self.shared.pending.lookup(id) else {
            trace!(%id, "ack for unknown command");
            return PushOutcome::Ignored;
        };
        {
            let mut st = cmd.lock();
            if st.status() != Status::Handling {
                trace!(%id, status = ?st.status(), "ack ignored");
                return PushOutcome::Ignored;
            }
            cmd.advance(&mut st, Status::Acked);
        }
        self.shared.supervisor.arm(
            &cmd,
            Status::Acked,
            self.shared.config.timeouts.third_stage,
        );
        trace!(%id, "command acked");
        PushOutcome::Acked
    }

    /// Delivers the final reply for a command and wakes its caller.
    ///
    /// `payload` fills the command's `scatter_in` regions in order; the rest
    /// lands in the reply body. An empty payload is allowed here.
    pub fn complete(&self, id: CommandId, payload: &[u8]) -> PushOutcome {
        if !self.is_attached() {
            return PushOutcome::Ignored;
        }
        let Some(cmd) = self.shared.pending.lookup(id) else {
            trace!(%id, "reply for unknown command");
            return PushOutcome::Ignored;
        };
        let timer = {
            let mut st = cmd.lock();
            if st.status().is_terminal() {
                trace!(%id, status = ?st.status(), "late reply ignored");
                return PushOutcome::Ignored;
            }
            let landed = scatter(cmd.scatter_in(), payload);
            st.scattered = landed;
            st.inbound = payload[landed..].to_vec();
            cmd.finish(&mut st, Status::Done)
        };
        if let Some(timer) = timer {
            self.shared.supervisor.cancel(timer);
        }
        Counters::bump(&self.shared.counters.completed);
        debug!(%id, len = payload.len(), "command completed");
        PushOutcome::Completed
    }

    /// Detaches this consumer, timing out everything still in flight.
    pub fn detach(self) {
        drop(self);
    }
}

impl Drop for ConsumerChannel {
    fn drop(&mut self) {
        // Release the continuation before draining so its hold does not
        // outlive the session.
        self.continuation = None;
        self.shared.detach(Some(self.session));
    }
}

impl std::fmt::Debug for ConsumerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerChannel")
            .field("session", &self.session)
            .field("attached", &self.is_attached())
            .field("continuation", &self.continuation.as_ref().map(|c| c.id()))
            .finish()
    }
}

/// Usable length of a pull buffer; frame lengths must fit the header's u32.
fn frame_room(buf: &[u8]) -> usize {
    buf.len().min(u32::MAX as usize)
}
