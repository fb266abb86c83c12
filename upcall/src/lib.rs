//! Synchronous command transport between many callers and a single
//! pull-style consumer.
//!
//! Callers block on [`Transport::submit`] while a daemon pulls framed
//! commands through its [`ConsumerChannel`] and pushes correlated replies
//! back. Commands move through staged timeouts, can be interrupted by their
//! caller, and stream bulk payloads through scatter/gather [`Region`]s.

pub mod codec;
pub mod protocol;
pub mod region;
pub mod timing;
pub mod trace;
pub mod transport;

pub use codec::{CallError, CodecError, Wire};
pub use region::{Direction, Page, Region, RegionError};
pub use trace::init_tracing;
pub use transport::{
    AttachError, CommandId, ConfigError, ConsumerChannel, Interrupt, MAX_STAGE, PullError, Pulled,
    PulledFrame, PushOutcome, Reply, Request, SequenceAllocator, Status, SubmitError, Timeout,
    TimeoutConfig, Transport, TransportConfig, TransportError, TransportStats,
};

// Re-export serde traits for convenience
pub use serde::{Deserialize, Serialize};
