use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use spacemouse_bridge::config::ConfigHandle;
use spacemouse_bridge::device;
use spacemouse_bridge::keyboard::LoggingKeyboard;
use spacemouse_bridge::server::{ServerBuilder, LISTEN_ADDR};
use spacemouse_bridge::tls::{self, TlsMaterial};
use tracing_subscriber::EnvFilter;

/// Hand-rolled in place of a CLI crate: the source this bridges only ever
/// exposed a handful of flags, so a small `std::env::args` scan covers it
/// without pulling in a parser.
struct Cli {
    listen: Option<String>,
    config: Option<PathBuf>,
    verbosity: i32,
}

impl Cli {
    fn parse() -> anyhow::Result<Self> {
        let mut cli = Cli {
            listen: None,
            config: None,
            verbosity: 0,
        };

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--listen" | "-l" => {
                    cli.listen = Some(args.next().ok_or_else(|| anyhow::anyhow!("--listen requires an address"))?);
                }
                "--config" | "-c" => {
                    let path = args.next().ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                    cli.config = Some(PathBuf::from(path));
                }
                "-v" => cli.verbosity += 1,
                "-q" => cli.verbosity -= 1,
                other => return Err(anyhow::anyhow!("unrecognized argument: {other}")),
            }
        }

        Ok(cli)
    }

    fn default_filter(&self) -> &'static str {
        match self.verbosity {
            i if i <= -1 => "warn",
            0 => "info",
            _ => "debug",
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::parse() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.default_filter())))
        .init();

    if let Err(err) = run(cli).await {
        tracing::error!(error = %err, "fatal startup failure");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ConfigHandle::load(cli.config.clone()).await;

    let tls_dir = match cli.config.as_ref().and_then(|p| p.parent()) {
        Some(parent) => parent.to_path_buf(),
        None => spacemouse_bridge::config::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not resolve config directory for TLS material"))?,
    };
    let material = TlsMaterial::in_dir(&tls_dir);
    let acceptor = tls::build_acceptor(&material).await?;

    let addr: SocketAddr = cli.listen.as_deref().unwrap_or(LISTEN_ADDR).parse()?;
    let server = ServerBuilder::new()
        .with_addr(addr)
        .with_tls(acceptor)
        .with_state(config, Arc::new(LoggingKeyboard));

    let device_events = server.device_event_sender();
    let (bus_tx, mut bus_rx) = spacemouse_bridge::bus::channel();

    std::thread::spawn(move || {
        device::run_device_reader(device::SPACENAV_SOCKET_PATH, bus_tx);
    });

    tokio::spawn(async move {
        while let Some(event) = bus_rx.recv().await {
            // `send` only errors when there are no subscribers; that's the
            // normal state with no connected CAD client, so it's not logged.
            let _ = device_events.send(event);
        }
    });

    server.run().await?;
    Ok(())
}
