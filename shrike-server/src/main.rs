use std::sync::Arc;

use clap::Parser;
use miette::{Context, IntoDiagnostic, Result};
use smtp::{ProxyOptions, ProxyServer};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Level};

mod callbacks;
mod config;
mod filter;

#[derive(Parser)]
#[command(name = "shrike")]
struct Args {
    /// Debug level (0 = errors only .. 4 = trace)
    #[arg(short = 'd', value_name = "LEVEL")]
    debug: Option<u8>,

    /// Path to config file
    #[arg(short = 'f', value_name = "FILE", default_value = "/etc/shrike.conf")]
    config: String,

    /// Write the daemon pid to this file
    #[arg(short = 'p', value_name = "FILE")]
    pidfile: Option<camino::Utf8PathBuf>,

    /// Print version information
    #[arg(short = 'v')]
    version: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        println!("shrike (version {})", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Configuration problems are fatal before we touch the network.
    let cfg = match config::Cfg::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("shrike: {e}");
            std::process::exit(2);
        }
    };

    init_tracing(args.debug);

    if let Some(pidfile) = &args.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))
            .into_diagnostic()
            .wrap_err("writing pid file")?;
    }

    let result = run_server(cfg).await;

    if let Some(pidfile) = &args.pidfile {
        let _ = std::fs::remove_file(pidfile);
    }
    result
}

fn init_tracing(debug: Option<u8>) {
    let level = match debug {
        None | Some(2) => Level::INFO,
        Some(0) => Level::ERROR,
        Some(1) => Level::WARN,
        Some(3) => Level::DEBUG,
        Some(_) => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_line_number(false)
        .with_level(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("SHRIKE_LOG_LEVEL")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .init();
}

async fn run_server(cfg: config::Cfg) -> Result<()> {
    let cfg = Arc::new(cfg);
    let shutdown = CancellationToken::new();

    // SIGTERM or ctrl-c stops accepting and asks running filters to abort.
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutting down");
        signal_token.cancel();
    });

    let options = ProxyOptions {
        upstream: cfg.out_address.clone(),
        spool_dir: cfg.directory.clone(),
        keep_spool: cfg.debug_files,
    };
    let server = ProxyServer::new(
        callbacks::FilterDispatch::new(Arc::clone(&cfg)),
        options,
        shutdown.clone(),
    );

    let listener = TcpListener::bind(&cfg.listen)
        .await
        .into_diagnostic()
        .wrap_err("binding listen address")?;
    info!(
        upstream = cfg.out_address,
        "SMTP proxy listening on {}", cfg.listen
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (socket, peer) = accepted
                    .into_diagnostic()
                    .wrap_err("accepting tcp connection")?;
                debug!(%peer, "accepted connection");
                let server = server.clone();
                tokio::spawn(async move {
                    if let Err(e) = server.handle_client(socket, peer).await {
                        error!("error handling client: {e:#}");
                    }
                });
            }
        }
    }
}
