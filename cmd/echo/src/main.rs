//! Netplex Echo Server
//!
//! Multi-reactor TCP echo: one acceptor handle plus one connection
//! handle per client, spread over the pool by least-loaded routing.
//! Quiet connections are evicted by the timing wheel after
//! `NPX_IDLE_TIMEOUT_MS`.
//!
//! Usage:
//!     cargo build --release -p netplex-echo
//!     ./target/release/netplex-echo [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 9900
//!
//!     # Quick load (from another terminal):
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9900 & done
//!
//!     # Verbose dispatch tracing:
//!     NPX_LOG_LEVEL=5 ./target/release/netplex-echo 7777

use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use netplex::{
    kdebug, ConnectionFactory, Disposition, EventScope, IoOutcome, Netplex, ReactorConfig,
    ReadinessHandle, RemoveDisposition, RemoveReason, Stream,
};

const BUF_SIZE: usize = 4096;

// ── Shared counters, printed from the main thread ──

struct EchoStats {
    accepts: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    closes: AtomicU64,
}

impl EchoStats {
    fn new() -> Self {
        Self {
            accepts: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            closes: AtomicU64::new(0),
        }
    }

    fn print(&self, handles: u32, elapsed_secs: f64) {
        eprintln!(
            "[{:.1}s] handles={} accepts={} bytes_in={} bytes_out={} closed={}",
            elapsed_secs,
            handles,
            self.accepts.load(Ordering::Relaxed),
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
            self.closes.load(Ordering::Relaxed),
        );
    }
}

// ── One handle per connection ──

struct EchoConnection {
    stream: Stream,
    buf: Box<[u8; BUF_SIZE]>,
    /// Bytes received and not yet echoed back
    pending: usize,
    /// Echoed prefix of `pending`
    sent: usize,
    stats: Arc<EchoStats>,
}

impl EchoConnection {
    fn new(stream: Stream, stats: Arc<EchoStats>) -> Self {
        Self {
            stream,
            buf: Box::new([0u8; BUF_SIZE]),
            pending: 0,
            sent: 0,
            stats,
        }
    }
}

impl ReadinessHandle for EchoConnection {
    fn name(&self) -> &str {
        "echo-conn"
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.fd()
    }

    // Strict alternation: read only while nothing is queued, write
    // only while something is. The reactor re-applies interest after
    // every Keep, so flipping these flags is enough.
    fn want_read(&self) -> bool {
        self.pending == 0
    }

    fn want_write(&self) -> bool {
        self.pending > 0
    }

    fn on_readable(&mut self, _scope: &mut EventScope) -> Disposition {
        match self.stream.read(&mut self.buf[..]) {
            Ok(IoOutcome::Done(n)) => {
                self.stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                self.pending = n;
                self.sent = 0;
                Disposition::Keep
            }
            Ok(IoOutcome::WouldBlock) => Disposition::Keep,
            Ok(IoOutcome::Closed) => Disposition::Remove,
            Err(_) => Disposition::Remove,
        }
    }

    fn on_writable(&mut self, _scope: &mut EventScope) -> Disposition {
        match self.stream.write(&self.buf[self.sent..self.pending]) {
            Ok(IoOutcome::Done(n)) => {
                self.stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                self.sent += n;
                if self.sent == self.pending {
                    self.pending = 0;
                    self.sent = 0;
                }
                Disposition::Keep
            }
            Ok(IoOutcome::WouldBlock) => Disposition::Keep,
            Ok(IoOutcome::Closed) => Disposition::Remove,
            Err(_) => Disposition::Remove,
        }
    }

    fn on_remote_close(&mut self, _scope: &mut EventScope) -> Disposition {
        Disposition::Remove
    }

    fn on_idle(&mut self, _scope: &mut EventScope) -> Disposition {
        kdebug!("echo-conn: evicting idle fd {}", self.stream.fd());
        Disposition::Remove
    }

    fn on_remove(&mut self, _reason: RemoveReason, _scope: &mut EventScope) -> RemoveDisposition {
        self.stats.closes.fetch_add(1, Ordering::Relaxed);
        RemoveDisposition::Destroy
    }
}

// ── Main ──

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9_900);

    // SIGINT/SIGTERM flip the run flag for clean shutdown
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
    }

    let config = ReactorConfig::from_env();
    let mut netplex = match Netplex::new(config) {
        Ok(netplex) => netplex,
        Err(e) => {
            eprintln!("netplex-echo: {}", e);
            std::process::exit(2);
        }
    };
    netplex.config().print();

    if let Err(e) = netplex.start() {
        eprintln!("netplex-echo: start failed: {}", e);
        std::process::exit(1);
    }

    let stats = Arc::new(EchoStats::new());
    let nodelay = netplex.config().tcp_nodelay;
    let factory_stats = stats.clone();
    let factory: ConnectionFactory = Box::new(move |stream| {
        factory_stats.accepts.fetch_add(1, Ordering::Relaxed);
        if nodelay {
            let _ = stream.set_nodelay(true);
        }
        Box::new(EchoConnection::new(stream, factory_stats.clone()))
    });

    let bound = match netplex.listen(Ipv4Addr::UNSPECIFIED, port, factory) {
        Ok(bound) => bound,
        Err(e) => {
            eprintln!("netplex-echo: listen failed: {}", e);
            std::process::exit(1);
        }
    };
    eprintln!(
        "netplex-echo: listening on 0.0.0.0:{} ({} reactors)",
        bound,
        netplex.config().reactors
    );

    let start = Instant::now();
    let mut last_stats = start;
    while RUNNING.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
        let now = Instant::now();
        if now.duration_since(last_stats).as_secs() >= 5 {
            stats.print(netplex.total_handles(), now.duration_since(start).as_secs_f64());
            last_stats = now;
        }
    }

    eprintln!("\nnetplex-echo: shutting down...");
    stats.print(netplex.total_handles(), start.elapsed().as_secs_f64());
    netplex.stop();
    eprintln!("netplex-echo: done.");
}
