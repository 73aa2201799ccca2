mod cache;
mod config;
mod engine;
mod feed;
mod resolver;
mod store;
#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::load_config;
use crate::engine::Engine;
use crate::feed::{FeedFormat, extract_domains};
use crate::resolver::SystemResolver;
use crate::store::{BlocklistWriter, SqliteBlocklist};

const MAX_UDP_PACKET: usize = 4096;

#[derive(Parser, Debug)]
#[command(author, version, about = "DNS resolver that null-routes blocklisted domains", long_about = None)]
struct Args {
    /// Config file path (JSON); defaults apply when omitted
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Override the UDP listen address
    #[arg(long = "bind")]
    bind: Option<String>,
    /// Verbose logging
    #[arg(long = "debug", env = "NULLROUTE_DEBUG", default_value_t = false)]
    debug: bool,
    /// Number of UDP workers (defaults to the CPU count)
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load blocklist feed files into the database
    Import {
        /// Database to create or extend
        #[arg(long = "db", default_value = "db/blocklist.db")]
        db: PathBuf,
        /// Feed syntax; guessed from each file name when omitted
        #[arg(long = "format", value_enum)]
        format: Option<FeedFormat>,
        /// Feed files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    if let Some(Command::Import { db, format, files }) = args.command {
        return run_import(&db, format, &files);
    }

    let mut cfg = load_config(args.config.as_deref()).context("load config")?;
    if let Some(bind) = args.bind {
        cfg.settings.bind_udp = bind;
    }
    let settings = cfg.settings;
    let bind_addr = settings.bind_addr()?;

    let store = SqliteBlocklist::open_read_only(&settings.blocklist_db).with_context(|| {
        format!("open blocklist db: {}", settings.blocklist_db.display())
    })?;
    let upstream = SystemResolver::new(settings.upstream_timeout());
    let engine = Engine::new(&settings, Arc::new(store), Arc::new(upstream));

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    let sockets = bind_udp_sockets(bind_addr, udp_workers)?;
    info!(
        bind_udp = %bind_addr,
        udp_workers = udp_workers,
        blocklist_db = %settings.blocklist_db.display(),
        "dns server started"
    );

    for (worker_id, socket) in sockets.into_iter().enumerate() {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(err) = run_udp_worker(worker_id, socket, engine).await {
                error!(worker_id, error = %err, "udp worker exited");
            }
        });
    }

    if settings.stats_interval_secs > 0 {
        let engine = engine.clone();
        let period = Duration::from_secs(settings.stats_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!(target = "stats", "{}", engine.metrics_snapshot());
            }
        });
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!(stats = %engine.metrics_snapshot(), "shutting down");
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn run_import(db: &Path, format: Option<FeedFormat>, files: &[PathBuf]) -> anyhow::Result<()> {
    if let Some(parent) = db.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create db directory: {}", parent.display()))?;
    }
    let mut writer =
        BlocklistWriter::open(db).with_context(|| format!("open blocklist db: {}", db.display()))?;

    for file in files {
        let feed_format = format.unwrap_or_else(|| FeedFormat::detect(file));
        let data = match std::fs::read_to_string(file) {
            Ok(data) => data,
            Err(err) => {
                warn!(file = %file.display(), error = %err, "skipping unreadable feed");
                continue;
            }
        };
        let domains = extract_domains(feed_format, &data);
        let inserted = writer
            .insert_all(&domains)
            .with_context(|| format!("insert domains from {}", file.display()))?;
        info!(
            file = %file.display(),
            format = ?feed_format,
            parsed = domains.len(),
            inserted,
            "feed imported"
        );
    }
    Ok(())
}

/// One socket per worker. On Unix they share the port via SO_REUSEPORT and
/// the kernel spreads datagrams; elsewhere every worker shares one socket.
fn bind_udp_sockets(addr: SocketAddr, workers: usize) -> anyhow::Result<Vec<Arc<UdpSocket>>> {
    let workers = workers.max(1);
    let mut sockets = Vec::with_capacity(workers);

    #[cfg(unix)]
    {
        for worker_id in 0..workers {
            let std_socket = create_udp_socket(addr, true)
                .with_context(|| format!("bind udp socket {} for worker {}", addr, worker_id))?;
            sockets.push(Arc::new(UdpSocket::from_std(std_socket)?));
        }
    }

    #[cfg(not(unix))]
    {
        let std_socket =
            create_udp_socket(addr, false).with_context(|| format!("bind udp socket {}", addr))?;
        let shared = Arc::new(UdpSocket::from_std(std_socket)?);
        for _ in 0..workers {
            sockets.push(Arc::clone(&shared));
        }
    }

    Ok(sockets)
}

fn create_udp_socket(addr: SocketAddr, reuse_port: bool) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        set_reuse_port(&socket);
    }
    if let Err(e) = socket.set_recv_buffer_size(4 * 1024 * 1024) {
        warn!("failed to set udp recv buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(4 * 1024 * 1024) {
        warn!("failed to set udp send buffer size: {}", e);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

#[cfg(unix)]
fn set_reuse_port(socket: &socket2::Socket) {
    use libc::{SO_REUSEPORT, SOL_SOCKET, c_int, c_void, setsockopt, socklen_t};
    use std::os::unix::io::AsRawFd;
    let val: c_int = 1;
    let ret = unsafe {
        setsockopt(
            socket.as_raw_fd(),
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        // without reuseport the later binds fail and surface as a bind error
        warn!("SO_REUSEPORT not applied: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn set_reuse_port(_socket: &socket2::Socket) {}

/// Receive loop: every datagram is answered in its own task, replying to the
/// exact address and port it came from.
async fn run_udp_worker(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    engine: Engine,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; MAX_UDP_PACKET];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(err) => {
                // e.g. ICMP port unreachable from an earlier reply
                debug!(worker_id, error = %err, "udp recv error");
                continue;
            }
        };
        let packet = Bytes::copy_from_slice(&buf[..len]);

        let engine = engine.clone();
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            match engine.handle_packet(&packet, peer).await {
                Ok(resp) => {
                    if let Err(err) = socket.send_to(&resp, peer).await {
                        warn!(client = %peer, error = %err, "failed to send response");
                    }
                }
                Err(reason) => {
                    debug!(client = %peer, reason = %reason, "query dropped");
                }
            }
        });
    }
}
