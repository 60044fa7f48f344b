use clap::Parser;
use std::collections::HashSet;
use std::env;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process;
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

use dns_forwarder::stats::Stats;
use dns_forwarder::upstream::UPSTREAM_PORT;
use dns_types::blocklist::types::Blocklist;

const DNS_PORT: u16 = 53;

/// Exit code when the blocklist file cannot be read.  (clap exits
/// with its own code, 2, for bad arguments.)
const EXIT_BLOCKLIST_FILE: i32 = 3;

/// Exit code when serving cannot be set up: bind failure, or no
/// signal handling.
const EXIT_SOCKET: i32 = 4;

/// Read and parse the blocklist, reporting each line that
/// normalisation rejected.  Skipped lines do not fail the load; an
/// unreadable file does.
async fn load_blocklist(path: &Path) -> Result<Blocklist, io::Error> {
    let data = tokio::fs::read_to_string(path).await?;
    let (blocklist, skipped) = Blocklist::deserialise(&data);

    for line in &skipped {
        tracing::warn!(
            number = %line.number,
            text = %line.text,
            error = %line.error,
            "skipping blocklist line"
        );
    }

    Ok(blocklist)
}

/// The serve loop: strictly sequential, one datagram at a time, with
/// the shutdown signals observed between datagrams.  A datagram
/// being handled - including its upstream wait - finishes before a
/// pending signal is seen.
async fn listen_udp(args: &Args, blocklist: &Blocklist, socket: &UdpSocket) -> Stats {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGINT");
            process::exit(EXIT_SOCKET);
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGTERM");
            process::exit(EXIT_SOCKET);
        }
    };

    let mut stats = Stats::new();
    let mut buf = vec![0u8; 512];

    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((size, peer)) => {
                    tracing::debug!(?peer, "UDP request");
                    let response = dns_forwarder::handle_datagram(
                        blocklist,
                        &args.upstream,
                        UPSTREAM_PORT,
                        &mut stats,
                        &buf[..size],
                    )
                    .instrument(tracing::info_span!("request", %peer))
                    .await;

                    if let Some(response) = response {
                        if let Err(error) = socket.send_to(&response, peer).await {
                            tracing::debug!(?peer, ?error, "UDP send error");
                        }
                    }
                }
                Err(error) => tracing::debug!(?error, "UDP receive error"),
            },
        }
    }

    stats
}

fn begin_logging(verbose: bool) {
    // without --verbose the process is silent except for fatal
    // problems; RUST_LOG overrides either default
    let default_directive = if verbose { "info" } else { "error" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let log_format = if let Ok(var) = env::var("RUST_LOG_FORMAT") {
        let mut set = HashSet::new();
        for s in var.split(',') {
            set.insert(s.to_string());
        }
        set
    } else {
        HashSet::new()
    };

    let logger = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(!log_format.contains("no-ansi"));

    if log_format.contains("json") {
        if log_format.contains("no-time") {
            logger.json().without_time().init();
        } else {
            logger.json().init();
        }
    } else if log_format.contains("no-time") {
        logger.without_time().init();
    } else {
        logger.init();
    }
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser)]
/// A filtering DNS forwarder.
///
/// filtered answers NXDOMAIN for every name on the blocklist (and
/// every subdomain of one), and forwards any other query to a single
/// upstream resolver, returning the upstream's answer untouched.
///
/// It speaks IPv4 and UDP only, and serves A queries: anything else
/// is answered NOTIMPL.  It is not a resolver - it never recurses,
/// caches, or rewrites answers - just a small appliance for cheaply
/// saying "no" to a large set of names.
#[derive(Clone)]
struct Args {
    /// Interface to listen on
    #[clap(short, long, value_parser, default_value_t = Ipv4Addr::UNSPECIFIED)]
    interface: Ipv4Addr,

    /// Port to listen on (ports below 1024 need elevated privileges)
    #[clap(short, long, value_parser = clap::value_parser!(u16).range(1..), default_value_t = DNS_PORT)]
    port: u16,

    /// Upstream nameserver: a dotted-quad IPv4 address or a hostname
    #[clap(short = 's', long, value_parser)]
    upstream: String,

    /// Path to the blocklist file: one domain per line, '#' comments
    #[clap(short = 'f', long, value_parser)]
    blocklist_file: PathBuf,

    /// Log every request and its decision
    #[clap(short, long, action(clap::ArgAction::SetTrue))]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    begin_logging(args.verbose);

    tracing::info!(
        upstream = %args.upstream,
        port = %args.port,
        blocklist_file = %args.blocklist_file.display(),
        "starting"
    );

    tracing::info!(path = %args.blocklist_file.display(), "loading blocklist");
    let blocklist = match load_blocklist(&args.blocklist_file).await {
        Ok(blocklist) => blocklist,
        Err(error) => {
            tracing::error!(
                path = %args.blocklist_file.display(),
                ?error,
                "could not load blocklist"
            );
            process::exit(EXIT_BLOCKLIST_FILE);
        }
    };
    tracing::info!(domains = %blocklist.len(), "loaded blocklist");

    tracing::info!(interface = %args.interface, port = %args.port, "binding DNS UDP socket");
    let socket = match UdpSocket::bind((args.interface, args.port)).await {
        Ok(socket) => socket,
        Err(error) => {
            tracing::error!(?error, "could not bind DNS UDP socket");
            process::exit(EXIT_SOCKET);
        }
    };

    let stats = listen_udp(&args, &blocklist, &socket).await;

    // the summary goes to stdout even when logging is quiet
    println!(
        "{} received, {} blocked, {} forwarded, {} errors",
        stats.total, stats.blocked, stats.forwarded, stats.errors
    );
}
