//! Randomized concurrency tests.
//!
//! Many callers race a consumer that answers, acknowledges, ignores or
//! double-answers commands at random. Every command must resolve exactly
//! once and the pending set must empty out afterwards.

use std::collections::HashSet;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use upcall::protocol::{self, FrameKind};
use upcall::{
    ConsumerChannel, Interrupt, PushOutcome, Region, Request, SubmitError, Timeout, TimeoutConfig,
    Transport, TransportConfig, TransportStats,
};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        upcall::init_tracing();
    });
}

fn transport() -> Transport {
    init_test_tracing();
    let timeouts = TimeoutConfig::local()
        .with_first_stage(Duration::from_millis(100))
        .with_second_stage(Duration::from_millis(150))
        .with_third_stage(Duration::from_millis(250))
        .with_tick(Duration::from_millis(1));
    Transport::new(TransportConfig::default().with_timeouts(timeouts).with_wheel_slots(256))
        .expect("valid config")
}

fn resolved(stats: &TransportStats) -> u64 {
    stats.completed + stats.timed_out + stats.drained + stats.cancelled
}

/// Waits until every accepted command has resolved and been released.
fn settle(transport: &Transport) -> TransportStats {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let stats = transport.stats();
        if stats.pending == 0 && resolved(&stats) == stats.submitted {
            return stats;
        }
        assert!(Instant::now() < deadline, "transport never settled: {stats:?}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Serves commands with a random policy until `done` is set.
fn chaotic_consumer(mut consumer: ConsumerChannel, seed: u64, done: &AtomicBool) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buf = vec![0u8; 4096];
    while !done.load(Ordering::Acquire) {
        let Some(pulled) = consumer
            .pull_into(&mut buf, Timeout::Duration(Duration::from_millis(5)))
            .expect("consumer stays attached")
        else {
            continue;
        };
        let (header, body) = protocol::decode_frame(&buf[..pulled.len]).unwrap();
        if header.kind != FrameKind::Command {
            continue;
        }
        let body = body.to_vec();
        match rng.gen_range(0..20) {
            0..=11 => {
                consumer.complete(header.id, &body);
            }
            12..=16 => {
                consumer.ack(header.id);
                consumer.complete(header.id, &body);
            }
            17 | 18 => {
                let mut reply = Vec::new();
                protocol::encode_reply(header.id, &body, &mut reply);
                let first = consumer.push(&reply).unwrap();
                let second = consumer.push(&reply).unwrap();
                assert_eq!(second, PushOutcome::Ignored, "second reply after {first:?}");
            }
            // Never answered: the second stage times it out.
            _ => {}
        }
    }
}

#[test]
fn every_command_resolves_exactly_once() {
    const CALLERS: u64 = 6;
    const COMMANDS: usize = 100;

    let transport = transport();
    let consumer = transport.attach().unwrap();
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| chaotic_consumer(consumer, 0x5eed, &done));

        let callers: Vec<_> = (0..CALLERS)
            .map(|n| {
                let transport = &transport;
                s.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(n);
                    for _ in 0..COMMANDS {
                        let mut body = vec![0u8; rng.gen_range(1..64)];
                        rng.fill(&mut body[..]);
                        let mut request = Request::new(body.clone());
                        let interruptible = rng.gen_ratio(1, 8);
                        if interruptible {
                            let interrupt = Interrupt::new();
                            interrupt.fire();
                            request = request.interruptible(&interrupt);
                        }
                        match transport.submit(request) {
                            Ok(reply) => assert_eq!(reply.payload, body),
                            Err(SubmitError::Timeout) => {}
                            Err(SubmitError::Interrupted) => assert!(interruptible),
                            Err(e) => panic!("unexpected submit failure: {e}"),
                        }
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        // Orphaned interrupted commands still get answered or time out.
        let deadline = Instant::now() + Duration::from_secs(10);
        while transport.pending_len() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        done.store(true, Ordering::Release);
    });

    let stats = settle(&transport);
    assert_eq!(stats.submitted, CALLERS * COMMANDS as u64);
    assert_eq!(stats.rejected, 0);
    assert_eq!(stats.cancelled, 0);
    assert!(stats.completed > 0);
}

#[test]
fn concurrent_submits_get_unique_ids() {
    const CALLERS: usize = 8;
    const COMMANDS: usize = 200;

    let transport = transport();
    let mut consumer = transport.attach().unwrap();

    let seen = thread::scope(|s| {
        for _ in 0..CALLERS {
            s.spawn(|| {
                for n in 0..COMMANDS {
                    let landing = Region::from_consumer(2);
                    let request = Request::new(n.to_le_bytes().to_vec()).region(landing.clone());
                    let reply = transport.submit(request).expect("answered");
                    assert_eq!(reply.scattered, 2);
                    assert_eq!(landing.to_vec(), &n.to_le_bytes()[..2]);
                    assert_eq!(reply.payload, &n.to_le_bytes()[2..]);
                }
            });
        }

        let mut seen = HashSet::new();
        while seen.len() < CALLERS * COMMANDS {
            let frame = consumer
                .pull(256, Timeout::Duration(Duration::from_secs(5)))
                .unwrap()
                .expect("callers keep submitting");
            assert!(seen.insert(frame.id()), "id {} issued twice", frame.id());
            assert_eq!(
                consumer.complete(frame.id(), frame.body()),
                PushOutcome::Completed
            );
        }
        seen
    });

    assert_eq!(seen.len(), CALLERS * COMMANDS);
    let stats = settle(&transport);
    assert_eq!(stats.completed, (CALLERS * COMMANDS) as u64);
}

#[test]
fn consumer_churn_never_strands_a_caller() {
    const CALLERS: u64 = 4;
    const COMMANDS: usize = 150;

    let transport = transport();
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            let mut rng = StdRng::seed_from_u64(99);
            let mut buf = vec![0u8; 256];
            while !stop.load(Ordering::Acquire) {
                let mut consumer = transport.attach().expect("single consumer");
                let until = Instant::now() + Duration::from_millis(rng.gen_range(1..10));
                while Instant::now() < until {
                    if let Ok(Some(pulled)) =
                        consumer.pull_into(&mut buf, Timeout::Duration(Duration::from_millis(1)))
                    {
                        let (header, body) = protocol::decode_frame(&buf[..pulled.len]).unwrap();
                        let body = body.to_vec();
                        consumer.complete(header.id, &body);
                    }
                }
                consumer.detach();
                thread::sleep(Duration::from_micros(rng.gen_range(0..500)));
            }
        });

        let callers: Vec<_> = (0..CALLERS)
            .map(|n| {
                let transport = &transport;
                s.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(1000 + n);
                    for _ in 0..COMMANDS {
                        let body = vec![rng.r#gen::<u8>(); rng.gen_range(1..16)];
                        match transport.submit(Request::new(body.clone())) {
                            Ok(reply) => assert_eq!(reply.payload, body),
                            Err(SubmitError::Timeout | SubmitError::NoConsumer) => {}
                            Err(e) => panic!("unexpected submit failure: {e}"),
                        }
                    }
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }
        stop.store(true, Ordering::Release);
    });

    let stats = settle(&transport);
    assert_eq!(stats.cancelled, 0);
    assert_eq!(
        stats.submitted + stats.rejected,
        CALLERS * COMMANDS as u64,
        "every call was either accepted or refused"
    );
}
