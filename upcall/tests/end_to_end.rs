//! End-to-end tests: real caller threads against a consumer channel.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=upcall=debug cargo test --features tracing --test end_to_end -- --nocapture
//! ```

use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use mio::{Events, Poll, Token, Waker};
use serde::{Deserialize, Serialize};

use upcall::protocol::{self, FrameKind, HEADER_SIZE, ProtocolError};
use upcall::{
    AttachError, Direction, Interrupt, Page, PullError, PushOutcome, Region, Request, SubmitError,
    Timeout, TimeoutConfig, Transport, TransportConfig, codec,
};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        upcall::init_tracing();
    });
}

fn transport_with(timeouts: TimeoutConfig) -> Transport {
    init_test_tracing();
    Transport::new(TransportConfig::default().with_timeouts(timeouts)).expect("valid config")
}

/// Budgets long enough that nothing times out on its own during a test.
fn patient() -> Transport {
    transport_with(
        TimeoutConfig::local()
            .with_first_stage(Duration::from_secs(10))
            .with_second_stage(Duration::from_secs(20))
            .with_third_stage(Duration::from_secs(30)),
    )
}

/// Spins until `cond` holds, failing the test after a few seconds.
fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn ping_pong() {
    let transport = patient();
    let mut consumer = transport.attach().unwrap();

    thread::scope(|s| {
        let caller = s.spawn(|| transport.submit(Request::new(b"PING".to_vec())));

        let frame = consumer.pull(64, Timeout::Infinite).unwrap().unwrap();
        assert_eq!(frame.header().kind, FrameKind::Command);
        assert_eq!(frame.body(), b"PING");
        let mut reply = Vec::new();
        protocol::encode_reply(frame.id(), b"PONG", &mut reply);
        assert_eq!(consumer.push(&reply), Ok(PushOutcome::Completed));

        let reply = caller.join().unwrap().unwrap();
        assert_eq!(reply.payload, b"PONG");
    });

    assert_eq!(transport.pending_len(), 0);
    let stats = transport.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.completed, 1);
}

#[test]
fn no_consumer_fails_fast() {
    let transport = patient();
    let started = Instant::now();
    assert_eq!(
        transport.submit(Request::new(b"STAT".to_vec())),
        Err(SubmitError::NoConsumer)
    );
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(transport.pending_len(), 0);
    assert!(SubmitError::NoConsumer.is_io_class());
}

#[test]
fn second_consumer_is_refused() {
    let transport = patient();
    let first = transport.attach().unwrap();
    assert_eq!(transport.attach().unwrap_err(), AttachError::AlreadyAttached);
    drop(first);
    assert!(transport.attach().is_ok());
}

#[test]
fn timeouts_are_staged() {
    let t1 = Duration::from_millis(50);
    let t2 = Duration::from_millis(400);
    let t3 = Duration::from_millis(1200);
    let transport = transport_with(
        TimeoutConfig::local()
            .with_first_stage(t1)
            .with_second_stage(t2)
            .with_third_stage(t3)
            .with_tick(Duration::from_millis(1)),
    );
    let mut consumer = transport.attach().unwrap();

    // Never pulled: first stage.
    let started = Instant::now();
    assert_eq!(
        transport.submit(Request::new(b"T1".to_vec())),
        Err(SubmitError::Timeout)
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= t1 && elapsed < t2, "T1 fired after {elapsed:?}");

    // Drop the stale command so the next pull sees the fresh one.
    wait_until("stale command removal", || transport.pending_len() == 0);

    thread::scope(|s| {
        // Pulled, never acknowledged: second stage.
        let caller = s.spawn(|| {
            let started = Instant::now();
            (transport.submit(Request::new(b"T2".to_vec())), started.elapsed())
        });
        consumer.pull(64, Timeout::Infinite).unwrap().unwrap();
        let (result, elapsed) = caller.join().unwrap();
        assert_eq!(result, Err(SubmitError::Timeout));
        assert!(elapsed >= t2 && elapsed < t3, "T2 fired after {elapsed:?}");

        // Pulled and acknowledged: third stage.
        let caller = s.spawn(|| {
            let started = Instant::now();
            (transport.submit(Request::new(b"T3".to_vec())), started.elapsed())
        });
        let frame = consumer.pull(64, Timeout::Infinite).unwrap().unwrap();
        assert_eq!(consumer.ack(frame.id()), PushOutcome::Acked);
        assert_eq!(consumer.ack(frame.id()), PushOutcome::Ignored, "ack only once");
        let (result, elapsed) = caller.join().unwrap();
        assert_eq!(result, Err(SubmitError::Timeout));
        assert!(elapsed >= t3, "T3 fired after {elapsed:?}");

        // Too late to answer.
        assert_eq!(consumer.complete(frame.id(), b"late"), PushOutcome::Ignored);
    });

    assert_eq!(transport.stats().timed_out, 3);
}

#[test]
fn first_stage_can_be_overridden_per_request() {
    let transport = patient();
    let _consumer = transport.attach().unwrap();
    let started = Instant::now();
    let request = Request::new(b"quick".to_vec()).first_stage_timeout(Duration::from_millis(20));
    assert_eq!(transport.submit(request), Err(SubmitError::Timeout));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn detach_drains_every_state() {
    let transport = patient();
    let mut consumer = transport.attach().unwrap();

    thread::scope(|s| {
        let callers: Vec<_> = (0..3u8)
            .map(|n| {
                let transport = &transport;
                s.spawn(move || transport.submit(Request::new(vec![n])))
            })
            .collect();
        wait_until("three submissions", || transport.stats().submitted == 3);

        // One stays Sending, one goes Handling, one goes Acked.
        let handling = consumer.pull(64, Timeout::Infinite).unwrap().unwrap();
        let acked = consumer.pull(64, Timeout::Infinite).unwrap().unwrap();
        assert_ne!(handling.id(), acked.id());
        assert_eq!(consumer.ack(acked.id()), PushOutcome::Acked);
        assert!(transport.has_admissible_work());

        consumer.detach();
        assert!(!transport.is_consumer_attached());
        for caller in callers {
            assert_eq!(caller.join().unwrap(), Err(SubmitError::Timeout));
        }
    });

    assert!(!transport.has_admissible_work());
    assert_eq!(transport.pending_len(), 0);
    assert_eq!(transport.stats().drained, 3);
    assert_eq!(
        transport.submit(Request::new(Vec::new())),
        Err(SubmitError::NoConsumer)
    );
}

#[test]
fn forced_detach_wakes_blocked_pull() {
    let transport = patient();
    let mut consumer = transport.attach().unwrap();

    thread::scope(|s| {
        let puller = s.spawn(move || {
            let mut buf = [0u8; 64];
            consumer.pull_into(&mut buf, Timeout::Infinite)
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(transport.on_consumer_detached(), 0);
        assert_eq!(puller.join().unwrap(), Err(PullError::Detached));
    });
    assert!(transport.attach().is_ok(), "a new consumer can attach");
}

#[test]
fn scatter_gather_round_trip() {
    let transport = patient();
    let mut consumer = transport.attach().unwrap();

    let first: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let source = Page::from_slice(&[0xAB; 2000]);
    let second = Region::page(&source, 0, 2000, Direction::ToConsumer).unwrap();
    let sink = Page::zeroed();
    let sink_window = Region::page(&sink, 100, 500, Direction::FromConsumer).unwrap();
    let tail = Region::from_consumer(10);

    let request = Request::new(b"WRITE".to_vec())
        .region(Region::to_consumer(first.clone()))
        .region(second)
        .region(sink_window)
        .region(tail.clone());

    thread::scope(|s| {
        let caller = s.spawn(|| transport.submit(request));
        wait_until("submission", || transport.has_admissible_work());

        let mut tiny = [0u8; 8];
        assert_eq!(
            consumer.pull_into(&mut tiny, Timeout::Infinite),
            Err(PullError::BufferTooSmall {
                need: HEADER_SIZE + 5,
                have: 8
            })
        );
        assert!(transport.has_admissible_work(), "still queued");

        // Body and the first region fit; the second does not.
        let mut buf = vec![0u8; 4096];
        let pulled = consumer.pull_into(&mut buf, Timeout::Infinite).unwrap().unwrap();
        assert_eq!(pulled.kind, FrameKind::Command);
        assert!(pulled.more);
        let (header, body) = protocol::decode_frame(&buf[..pulled.len]).unwrap();
        assert_eq!(header.id, pulled.id);
        assert_eq!(&body[..5], b"WRITE");
        assert_eq!(&body[5..], &first[..]);

        let mut small = vec![0u8; 100];
        assert_eq!(
            consumer.pull_into(&mut small, Timeout::Infinite),
            Err(PullError::BufferTooSmall {
                need: HEADER_SIZE + 2000,
                have: 100
            })
        );

        let rest = consumer.pull_into(&mut buf, Timeout::Infinite).unwrap().unwrap();
        assert_eq!(rest.kind, FrameKind::Continuation);
        assert_eq!(rest.id, pulled.id);
        assert!(!rest.more);
        let (_, body) = protocol::decode_frame(&buf[..rest.len]).unwrap();
        assert_eq!(body, &[0xAB; 2000][..]);

        let reply: Vec<u8> = (0..600u32).map(|i| (i % 7) as u8).collect();
        assert_eq!(consumer.complete(pulled.id, &reply), PushOutcome::Completed);

        let result = caller.join().unwrap().unwrap();
        assert_eq!(result.scattered, 510);
        assert_eq!(result.payload, &reply[510..]);
        assert_eq!(&sink.to_vec()[100..600], &reply[..500]);
        assert_eq!(tail.to_vec(), &reply[500..510]);
        assert!(sink.to_vec()[..100].iter().all(|&b| b == 0), "window respected");
    });
}

#[test]
fn interrupted_caller_leaves_command_safe() {
    let transport = patient();
    let mut consumer = transport.attach().unwrap();
    let interrupt = Interrupt::new();
    let landing = Region::from_consumer(4);

    thread::scope(|s| {
        let request = Request::new(b"READ".to_vec())
            .region(landing.clone())
            .interruptible(&interrupt);
        let caller = s.spawn(|| transport.submit(request));

        let frame = consumer.pull(64, Timeout::Infinite).unwrap().unwrap();
        interrupt.fire();
        assert_eq!(caller.join().unwrap(), Err(SubmitError::Interrupted));

        // The command outlives its caller until the consumer answers.
        assert_eq!(transport.pending_len(), 1);
        assert_eq!(consumer.complete(frame.id(), b"DATA!"), PushOutcome::Completed);
    });

    assert_eq!(landing.to_vec(), b"DATA");
    assert_eq!(transport.pending_len(), 0);
    let stats = transport.stats();
    assert_eq!(stats.interrupted, 1);
    assert_eq!(stats.completed, 1);
}

#[test]
fn command_interrupted_before_pull_is_still_served() {
    let transport = patient();
    let mut consumer = transport.attach().unwrap();
    let interrupt = Interrupt::new();
    let landing = Region::from_consumer(2);

    thread::scope(|s| {
        let request = Request::new(b"STAT".to_vec())
            .region(landing.clone())
            .interruptible(&interrupt);
        let caller = s.spawn(|| transport.submit(request));
        wait_until("submission", || transport.has_admissible_work());

        interrupt.fire();
        assert_eq!(caller.join().unwrap(), Err(SubmitError::Interrupted));
        assert!(transport.has_admissible_work(), "still queued");

        let frame = consumer
            .pull(64, Timeout::Duration(Duration::ZERO))
            .unwrap()
            .expect("orphan stays pullable");
        assert_eq!(frame.id(), upcall::CommandId::from(1));
        assert_eq!(frame.body(), b"STAT");
        assert_eq!(consumer.ack(frame.id()), PushOutcome::Acked);
        assert_eq!(consumer.complete(frame.id(), b"OK!"), PushOutcome::Completed);
    });

    assert_eq!(landing.to_vec(), b"OK");
    assert_eq!(transport.pending_len(), 0);
    assert_eq!(transport.stats().completed, 1);
}

#[test]
fn malformed_and_unknown_replies() {
    let transport = patient();
    let consumer = transport.attach().unwrap();

    assert_eq!(
        consumer.push(&[1, 2, 3]),
        Err(ProtocolError::BufferTooSmall { need: 8, have: 3 })
    );
    let unknown = protocol::encode_ack(upcall::CommandId::from(999));
    assert_eq!(consumer.push(&unknown), Ok(PushOutcome::Ignored));
    assert_eq!(
        consumer.complete(upcall::CommandId::from(999), b"x"),
        PushOutcome::Ignored
    );
}

#[test]
fn readiness_waker_fires_on_new_work() {
    let transport = patient();
    let mut consumer = transport.attach().unwrap();
    let mut poll = Poll::new().unwrap();
    const WAKE: Token = Token(7);
    consumer.set_waker(Arc::new(Waker::new(poll.registry(), WAKE).unwrap()));
    assert!(!consumer.poll_ready());

    thread::scope(|s| {
        let caller = s.spawn(|| transport.submit(Request::new(b"POLL".to_vec())));

        let mut events = Events::with_capacity(4);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !consumer.poll_ready() {
            assert!(Instant::now() < deadline, "no readiness");
            poll.poll(&mut events, Some(Duration::from_millis(100))).unwrap();
        }

        let frame = consumer
            .pull(64, Timeout::Duration(Duration::ZERO))
            .unwrap()
            .expect("ready work");
        assert_eq!(consumer.complete(frame.id(), b"OK"), PushOutcome::Completed);
        assert_eq!(caller.join().unwrap().unwrap().payload, b"OK");
    });
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
enum FsOp {
    Lookup { parent: u64, name: String },
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Attr {
    inode: u64,
    size: u64,
}

#[test]
fn typed_call() {
    let transport = patient();
    let mut consumer = transport.attach().unwrap();

    thread::scope(|s| {
        let caller = s.spawn(|| {
            let op = FsOp::Lookup {
                parent: 1,
                name: "etc".into(),
            };
            transport.call::<FsOp, Attr>(&op, Request::new(Vec::new()))
        });

        let frame = consumer.pull(256, Timeout::Infinite).unwrap().unwrap();
        let op: FsOp = codec::decode_body(&frame).unwrap();
        assert_eq!(
            op,
            FsOp::Lookup {
                parent: 1,
                name: "etc".into()
            }
        );
        let mut reply = Vec::new();
        codec::encode_reply(frame.id(), &Attr { inode: 42, size: 4096 }, &mut reply).unwrap();
        assert_eq!(consumer.push(&reply), Ok(PushOutcome::Completed));

        let attr = caller.join().unwrap().unwrap();
        assert_eq!(attr, Attr { inode: 42, size: 4096 });
    });
}

#[test]
fn close_cancels_blocked_callers() {
    let transport = patient();
    let mut consumer = transport.attach().unwrap();

    thread::scope(|s| {
        let caller = s.spawn(|| transport.submit(Request::new(b"SLOW".to_vec())));
        consumer.pull(64, Timeout::Infinite).unwrap().unwrap();
        transport.close();
        assert_eq!(caller.join().unwrap(), Err(SubmitError::Cancelled));
    });

    let mut buf = [0u8; 64];
    assert_eq!(
        consumer.pull_into(&mut buf, Timeout::Infinite),
        Err(PullError::Shutdown)
    );
    assert_eq!(transport.stats().cancelled, 1);
    assert_eq!(transport.pending_len(), 0);
}
