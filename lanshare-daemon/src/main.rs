// LanShare: advertise, browse and receive files on the local network; send one-shot from the CLI.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use lanshare_core::NullSink;
use lanshare_daemon::{config, LogSink, MdnsBackend, ShareService, TransferEngine, TransferSettings};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const PEERS_WAIT: Duration = Duration::from_secs(3);

const USAGE: &str = "usage:
  lanshare                        run the daemon (receive files, advertise, browse)
  lanshare send <ip> <port> <file>
  lanshare peers [--json]
  lanshare --version";

enum Command {
    Daemon,
    Send { ip: String, port: u32, path: PathBuf },
    Peers { json: bool },
    Version,
}

fn parse_args(args: &[String]) -> anyhow::Result<Command> {
    if args.iter().any(|a| a == "--version" || a == "-V") {
        return Ok(Command::Version);
    }
    match args.first().map(String::as_str) {
        None => Ok(Command::Daemon),
        Some("send") => {
            let [ip, port, path] = &args[1..] else {
                bail!("send takes <ip> <port> <file>\n{USAGE}");
            };
            let port = port
                .parse::<u32>()
                .with_context(|| format!("port {port:?} is not a number"))?;
            Ok(Command::Send {
                ip: ip.clone(),
                port,
                path: PathBuf::from(path),
            })
        }
        Some("peers") => match &args[1..] {
            [] => Ok(Command::Peers { json: false }),
            [flag] if flag == "--json" => Ok(Command::Peers { json: true }),
            _ => bail!("peers takes only --json\n{USAGE}"),
        },
        Some(other) => bail!("unknown command {other:?}\n{USAGE}"),
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    if let Command::Version = command {
        println!("lanshare {VERSION}");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        match command {
            Command::Daemon => run_daemon(cfg).await,
            Command::Send { ip, port, path } => {
                let engine = TransferEngine::new(TransferSettings::from(&cfg), Arc::new(LogSink));
                engine
                    .send_file(&ip, port, &path)
                    .await
                    .with_context(|| format!("sending {}", path.display()))
            }
            Command::Peers { json } => list_peers(cfg, json).await,
            Command::Version => Ok(()),
        }
    });
    // The mDNS receiver threads end once the backend is dropped inside block_on.
    rt.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run_daemon(cfg: config::Config) -> anyhow::Result<()> {
    let backend = Arc::new(MdnsBackend::new(&hostname_or_default())?);
    let service = ShareService::new(cfg, backend, Arc::new(LogSink));
    service
        .start()
        .await
        .with_context(|| format!("starting {}", service.name()))?;
    tracing::info!(
        "receiving into {}",
        service.config().receive_dir.display()
    );
    shutdown_signal().await?;
    tracing::info!("shutting down");
    service.stop();
    Ok(())
}

async fn list_peers(cfg: config::Config, json: bool) -> anyhow::Result<()> {
    let backend = Arc::new(MdnsBackend::new(&hostname_or_default())?);
    let service = ShareService::new(cfg, backend, Arc::new(NullSink));
    service.start_browsing()?;
    tokio::time::sleep(PEERS_WAIT).await;
    let peers = service.peers().await;
    service.stop();
    if json {
        println!("{}", serde_json::to_string_pretty(&peers)?);
        return Ok(());
    }
    if peers.is_empty() {
        println!("no peers found");
    }
    for p in &peers {
        match p.preferred_addr() {
            Some(addr) => println!("{}\t{addr}", p.name),
            None => println!("{}\t(no address)", p.name),
        }
    }
    Ok(())
}

fn hostname_or_default() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "lanshare".into())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
