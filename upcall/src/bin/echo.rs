//! Echo daemon demo.
//!
//! Runs an in-process transport with a consumer that echoes every command
//! back, driven by a mio poll loop, while caller threads hammer it with
//! random payloads and check each reply byte for byte.
//!
//! # Usage
//!
//! ```sh
//! upcall-echo --callers 8 --commands 1000 --payload 512
//! ```

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use mio::{Events, Poll, Token, Waker};
use rand::Rng;
use thiserror::Error;
use upcall::protocol::{self, FrameKind, HEADER_SIZE, ProtocolError};
use upcall::{
    AttachError, ConsumerChannel, PullError, Region, Request, Timeout, TimeoutConfig, Transport,
    TransportConfig, TransportError,
};

/// Consumer pull buffer size.
const PULL_BUFFER: usize = 64 * 1024;

/// Bytes of each reply routed into a caller-side region.
const SCATTER_HEAD: usize = 8;

const WAKE: Token = Token(0);

#[derive(Debug, Error)]
enum EchoError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error(transparent)]
    Pull(#[from] PullError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0} command(s) failed")]
    Failed(usize),
}

struct Options {
    callers: usize,
    commands: usize,
    payload: usize,
    timeouts: TimeoutConfig,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("upcall-echo: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), EchoError> {
    upcall::init_tracing();
    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    let transport = Transport::new(
        TransportConfig::default()
            .with_timeouts(options.timeouts)
            .with_name("echo"),
    )?;
    let consumer = transport.attach()?;
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
    consumer.set_waker(Arc::clone(&waker));
    let done = AtomicBool::new(false);

    eprintln!(
        "upcall-echo: {} caller(s) x {} command(s), payload up to {} bytes",
        options.callers, options.commands, options.payload
    );

    let failures = thread::scope(|s| -> Result<usize, EchoError> {
        let daemon = thread::Builder::new()
            .name("echo-daemon".into())
            .spawn_scoped(s, || serve(consumer, poll, &done))?;

        let mut callers = Vec::with_capacity(options.callers);
        for n in 0..options.callers {
            let handle = thread::Builder::new()
                .name(format!("echo-caller-{n}"))
                .spawn_scoped(s, || call_loop(&transport, &options))?;
            callers.push(handle);
        }
        let failures = callers
            .into_iter()
            .map(|h| h.join().unwrap_or(options.commands))
            .sum();

        done.store(true, Ordering::Release);
        waker.wake()?;
        let served = daemon
            .join()
            .map_err(|_| EchoError::Usage("daemon thread panicked".into()))??;
        eprintln!("upcall-echo: daemon served {served} command(s)");
        Ok(failures)
    })?;

    let stats = transport.stats();
    eprintln!(
        "upcall-echo: submitted={} completed={} timed_out={} rejected={} max_fired_per_tick={}",
        stats.submitted, stats.completed, stats.timed_out, stats.rejected, stats.max_fired_per_tick
    );
    transport.shutdown();

    if failures > 0 {
        return Err(EchoError::Failed(failures));
    }
    eprintln!("upcall-echo: all replies verified");
    Ok(())
}

/// Consumer loop: drain every ready command, then sleep on the poll until
/// the transport wakes us.
fn serve(mut consumer: ConsumerChannel, mut poll: Poll, done: &AtomicBool) -> Result<u64, EchoError> {
    let mut events = Events::with_capacity(8);
    let mut buf = vec![0u8; PULL_BUFFER];
    let mut served = 0;
    loop {
        while let Some(pulled) = consumer.pull_into(&mut buf, Timeout::Duration(Duration::ZERO))? {
            let (header, body) = protocol::decode_frame(&buf[..pulled.len])?;
            if header.kind != FrameKind::Command {
                continue;
            }
            consumer.ack(header.id);
            consumer.complete(header.id, body);
            served += 1;
        }
        if done.load(Ordering::Acquire) {
            return Ok(served);
        }
        poll.poll(&mut events, Some(Duration::from_millis(100)))?;
    }
}

/// Submits random payloads and returns how many replies were wrong or missing.
fn call_loop(transport: &Transport, options: &Options) -> usize {
    let mut rng = rand::thread_rng();
    let mut failures = 0;
    for _ in 0..options.commands {
        let len = rng.gen_range(1..=options.payload);
        let mut body = vec![0u8; len];
        rng.fill(&mut body[..]);
        let head = Region::from_consumer(len.min(SCATTER_HEAD));

        match transport.submit(Request::new(body.clone()).region(head.clone())) {
            Ok(reply) => {
                let mut echoed = head.to_vec();
                echoed.truncate(reply.scattered);
                echoed.extend_from_slice(&reply.payload);
                if echoed != body {
                    eprintln!("upcall-echo: reply mismatch for {len}-byte command");
                    failures += 1;
                }
            }
            Err(e) => {
                eprintln!("upcall-echo: submit failed: {e}");
                failures += 1;
            }
        }
    }
    failures
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, EchoError> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| EchoError::Usage(format!("missing value for {flag}")))
}

fn number<T: std::str::FromStr>(raw: &str, flag: &str) -> Result<T, EchoError> {
    raw.parse()
        .map_err(|_| EchoError::Usage(format!("invalid value for {flag}: {raw}")))
}

/// Parses command line arguments into [`Options`].
fn parse_args(args: &[String]) -> Result<Options, EchoError> {
    let mut options = Options {
        callers: 4,
        commands: 250,
        payload: 256,
        timeouts: TimeoutConfig::local(),
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--callers" | "-c" => {
                i += 1;
                options.callers = number(value(args, i, flag)?, flag)?;
            }
            "--commands" | "-n" => {
                i += 1;
                options.commands = number(value(args, i, flag)?, flag)?;
            }
            "--payload" | "-p" => {
                i += 1;
                options.payload = number(value(args, i, flag)?, flag)?;
            }
            "--t1-ms" => {
                i += 1;
                let ms = number(value(args, i, flag)?, flag)?;
                options.timeouts = options.timeouts.with_first_stage(Duration::from_millis(ms));
            }
            "--t2-ms" => {
                i += 1;
                let ms = number(value(args, i, flag)?, flag)?;
                options.timeouts = options.timeouts.with_second_stage(Duration::from_millis(ms));
            }
            "--t3-ms" => {
                i += 1;
                let ms = number(value(args, i, flag)?, flag)?;
                options.timeouts = options.timeouts.with_third_stage(Duration::from_millis(ms));
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(EchoError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    if options.payload == 0 || options.payload > PULL_BUFFER - HEADER_SIZE {
        return Err(EchoError::Usage(format!(
            "--payload must be between 1 and {}",
            PULL_BUFFER - HEADER_SIZE
        )));
    }
    Ok(options)
}

fn print_usage() {
    eprintln!(
        r#"upcall-echo - in-process echo daemon for the upcall transport

USAGE:
    upcall-echo [OPTIONS]

OPTIONS:
    -c, --callers <N>       Concurrent caller threads (default: 4)
    -n, --commands <N>      Commands per caller (default: 250)
    -p, --payload <BYTES>   Maximum command body size (default: 256)
        --t1-ms <MS>        Budget to be pulled (default: 500)
        --t2-ms <MS>        Budget to be acknowledged (default: 2000)
        --t3-ms <MS>        Budget to be answered (default: 10000)
    -h, --help              Print this help message

EXAMPLE:
    upcall-echo --callers 16 --commands 10000 --payload 4096
"#
    );
}
