//! IPC stress harness
//!
//! Runs a host and a remote processor as two threads over one in-process
//! loopback link. The host streams patterned frames on two endpoints while
//! the remote checks every byte, then both sides play ping-pong with an
//! application-level timeout.
//!
//! Usage:
//!   ipc-stress --frames 256 --slots 8 --payload 496 --pingpong 32

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, ensure, Context, Result};
use clap::Parser;
use ipc_service::config::{ELEMENT_SIZE, MAX_PAYLOAD_SIZE};
use ipc_service::mock::{LoopbackLink, LoopbackMailbox};
use ipc_service::{
    Endpoint, EndpointConfig, EndpointHandler, FnHandler, Instance, InstanceRegistry, IpcError, RxFrame,
    StdDelay, TxWait,
};

const DEMO_EPT: &str = "am_rpmsg_demo";
const DEMO_EPT2: &str = "am_rpmsg_demo_ep2";
const PINGPONG_EPT: &str = "am_rpmsg_pingpong";

#[derive(Parser, Debug)]
#[command(name = "ipc-stress")]
#[command(about = "Stream and ping-pong traffic across a loopback shared memory link")]
struct Args {
    /// Frames to stream on each demo endpoint
    #[arg(long, default_value_t = 64)]
    frames: usize,

    /// Buffers per direction
    #[arg(long, default_value_t = 8)]
    slots: usize,

    /// Payload bytes per streamed frame
    #[arg(long, default_value_t = MAX_PAYLOAD_SIZE)]
    payload: usize,

    /// Ping-pong round trips after streaming
    #[arg(long, default_value_t = 16)]
    pingpong: usize,

    /// Per-operation timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
}

/// `(i + seq) mod 256`, where `seq` wraps at the ring depth
fn pattern_byte(i: usize, seq: usize) -> u8 {
    ((i + seq) % 256) as u8
}

/// Remote-side checker for one streamed endpoint
struct PatternVerifier {
    name: &'static str,
    slots: usize,
    len: usize,
    seq: usize,
    good: Arc<AtomicUsize>,
    bad: Arc<AtomicUsize>,
}

impl EndpointHandler for PatternVerifier {
    fn received(&mut self, frame: &RxFrame<'_>) {
        let data = frame.data();
        let mismatch = data.len() != self.len
            || data
                .iter()
                .enumerate()
                .any(|(i, byte)| *byte != pattern_byte(i, self.seq));
        if mismatch {
            log::warn!("{}: frame with seq {} corrupted ({} bytes)", self.name, self.seq, data.len());
            self.bad.fetch_add(1, Ordering::Relaxed);
        } else {
            self.good.fetch_add(1, Ordering::Relaxed);
        }
        self.seq = (self.seq + 1) % self.slots;
    }

    fn error(&mut self, err: IpcError) {
        log::warn!("{}: {}", self.name, err);
        self.bad.fetch_add(1, Ordering::Relaxed);
    }
}

/// Host-side collector of pong replies
struct PongCounter {
    pongs: Arc<AtomicUsize>,
    last: Arc<AtomicUsize>,
}

impl EndpointHandler for PongCounter {
    fn received(&mut self, frame: &RxFrame<'_>) {
        if let Some(&first) = frame.data().first() {
            self.last.store(first as usize, Ordering::Release);
        }
        self.pongs.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
struct StreamStats {
    good: Arc<AtomicUsize>,
    bad: Arc<AtomicUsize>,
}

/// Drain one side's mailbox and receive if its instance was kicked
fn service(registry: &InstanceRegistry, mbox: &LoopbackMailbox, instance: &Arc<Instance>) -> Result<usize> {
    let mut kicked = 0u32;
    if let Err(err) = registry.mailbox_event_handle(mbox, &mut kicked) {
        log::warn!("{}: mailbox: {}", instance.name(), err);
    }
    if kicked & (1 << instance.index()) == 0 {
        return Ok(0);
    }
    let summary = instance
        .receive()
        .with_context(|| format!("{}: receive failed", instance.name()))?;
    if summary.dropped > 0 {
        log::warn!("{}: dropped {} frames", instance.name(), summary.dropped);
    }
    Ok(summary.delivered + summary.control)
}

fn run_host(args: &Args, link: &LoopbackLink) -> Result<()> {
    let registry = InstanceRegistry::new();
    let host = registry
        .create(link.host_config("host").delay(Arc::new(StdDelay)).build())
        .context("Failed to open host instance")?;

    let pongs = Arc::new(AtomicUsize::new(0));
    let last = Arc::new(AtomicUsize::new(0));
    let quiet = || FnHandler::new(|frame: &RxFrame<'_>| log::debug!("unexpected {:?}", frame));
    let demo = host.register_endpoint(EndpointConfig::new(DEMO_EPT), quiet())?;
    let demo2 = host.register_endpoint(EndpointConfig::new(DEMO_EPT2), quiet())?;
    let pingpong = host.register_endpoint(
        EndpointConfig::new(PINGPONG_EPT),
        PongCounter {
            pongs: Arc::clone(&pongs),
            last: Arc::clone(&last),
        },
    )?;

    let max_polls = args.timeout_ms as usize;
    let mbox = link.host_mailbox();
    for ept in [&demo, &demo2, &pingpong] {
        ept.wait_bound(max_polls, || {
            let _ = service(&registry, mbox, &host);
            thread::sleep(Duration::from_millis(1));
        })
        .with_context(|| format!("{} never bound", ept.name()))?;
    }
    log::info!("host: all endpoints bound");

    let started = Instant::now();
    for seq in 0..args.frames {
        for ept in [&demo, &demo2] {
            stream_frame(args, ept, seq % args.slots)?;
        }
    }
    log::info!(
        "host: streamed {} frames in {:?}",
        2 * args.frames,
        started.elapsed()
    );

    let started = Instant::now();
    for round in 0..args.pingpong {
        let ping = [(round % 256) as u8; 8];
        pingpong.send(&ping).context("Failed to send ping")?;

        let deadline = Instant::now() + Duration::from_millis(args.timeout_ms);
        while pongs.load(Ordering::Acquire) <= round {
            if Instant::now() >= deadline {
                bail!("ping {} timed out after {} ms", round, args.timeout_ms);
            }
            service(&registry, mbox, &host)?;
            thread::yield_now();
        }
        ensure!(
            last.load(Ordering::Acquire) == round % 256,
            "pong {} carried the wrong payload",
            round
        );
    }
    log::info!("host: {} round trips in {:?}", args.pingpong, started.elapsed());
    Ok(())
}

fn stream_frame(args: &Args, ept: &Endpoint, seq: usize) -> Result<()> {
    let wait = TxWait::Millis(args.timeout_ms as u32);
    let mut buf = ept
        .get_tx_buffer(args.payload, wait)
        .with_context(|| format!("{}: no tx buffer", ept.name()))?;
    for (i, byte) in buf[..args.payload].iter_mut().enumerate() {
        *byte = pattern_byte(i, seq);
    }
    ept.send_nocopy(buf, args.payload)
        .map_err(|err| anyhow!("{}: send failed: {}", ept.name(), err.kind))?;
    Ok(())
}

fn run_remote(args: &Args, link: &LoopbackLink, done: &AtomicBool, streams: &[StreamStats; 2]) -> Result<()> {
    let registry = InstanceRegistry::new();
    let remote = registry
        .create(link.remote_config("remote").delay(Arc::new(StdDelay)).build())
        .context("Failed to open remote instance")?;

    let verifier = |name: &'static str, stats: &StreamStats| PatternVerifier {
        name,
        slots: args.slots,
        len: args.payload,
        seq: 0,
        good: Arc::clone(&stats.good),
        bad: Arc::clone(&stats.bad),
    };
    let echo = FnHandler::new(|frame: &RxFrame<'_>| {
        if let Err(err) = frame.reply(frame.data()) {
            log::warn!("pong failed: {}", err);
        }
    });

    // The host may not have laid out the region yet
    let deadline = Instant::now() + Duration::from_millis(args.timeout_ms);
    while !remote.link_up() {
        if Instant::now() >= deadline {
            bail!("host never initialized the shared region");
        }
        thread::sleep(Duration::from_millis(1));
    }
    let _demo = remote.register_endpoint(EndpointConfig::new(DEMO_EPT), verifier(DEMO_EPT, &streams[0]))?;
    let _demo2 = remote.register_endpoint(EndpointConfig::new(DEMO_EPT2), verifier(DEMO_EPT2, &streams[1]))?;
    let _pingpong = remote.register_endpoint(EndpointConfig::new(PINGPONG_EPT), echo)?;
    log::info!("remote: endpoints announced");

    let mbox = link.remote_mailbox();
    while !done.load(Ordering::Acquire) {
        if service(&registry, mbox, &remote)? == 0 {
            thread::yield_now();
        }
    }
    remote.receive()?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    ensure!(args.slots > 0, "--slots must be positive");
    ensure!(
        args.payload > 0 && args.payload <= MAX_PAYLOAD_SIZE,
        "--payload must be 1..={}",
        MAX_PAYLOAD_SIZE
    );

    log::info!("IPC stress: {} frames x 2 endpoints, {} slots, {} byte payload", args.frames, args.slots, args.payload);

    let link = LoopbackLink::new(args.slots, ELEMENT_SIZE).context("Failed to allocate link")?;
    let done = AtomicBool::new(false);
    let streams = [StreamStats::default(), StreamStats::default()];

    let (host, remote) = thread::scope(|s| {
        let remote = s.spawn(|| run_remote(&args, &link, &done, &streams));
        let host = s.spawn(|| {
            let result = run_host(&args, &link);
            done.store(true, Ordering::Release);
            result
        });
        (host.join(), remote.join())
    });
    host.map_err(|_| anyhow!("host thread panicked"))??;
    remote.map_err(|_| anyhow!("remote thread panicked"))??;

    let mut failed = false;
    for (name, stats) in [DEMO_EPT, DEMO_EPT2].iter().zip(&streams) {
        let good = stats.good.load(Ordering::Relaxed);
        let bad = stats.bad.load(Ordering::Relaxed);
        log::info!("{}: {} verified, {} corrupted", name, good, bad);
        failed |= good != args.frames || bad != 0;
    }
    if failed {
        bail!("pattern verification failed");
    }
    log::info!("IPC stress passed");
    Ok(())
}
