use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use distributor::Distributor;
use tracing::error;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

const LOG_ENV: &str = "DISTRIBUTOR_LOG";

/// Serve a directory of files over BitTorrent.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Arguments {
    /// Verbose mode (extra output)
    #[arg(long)]
    verbose: bool,

    /// Extra verbose (debugging output)
    #[arg(long)]
    debug: bool,

    /// IP address to bind to for serving
    #[arg(long, default_value = "127.0.0.1")]
    listen: String,

    /// Port to serve tracker/torrents on
    #[arg(long, default_value_t = 6390)]
    port: u16,

    /// Directory to serve files from
    #[arg(long, default_value = "/var/www")]
    serve: PathBuf,

    /// Path to the ctorrent binary
    #[arg(long, default_value = "/usr/local/bin/ctorrent")]
    ctorrent: PathBuf,
}

fn setup_logger(args: &Arguments) {
    let default = if args.debug {
        LevelFilter::DEBUG
    } else if args.verbose {
        LevelFilter::INFO
    } else {
        LevelFilter::WARN
    };

    let filter = EnvFilter::builder()
        .with_env_var(LOG_ENV)
        .with_default_directive(default.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Arguments::parse();
    setup_logger(&args);

    let distributor = match Distributor::new(&args.serve, &args.ctorrent, args.listen, args.port) {
        Ok(distributor) => distributor,
        Err(err) => {
            eprintln!("error creating distributor: {}", err);
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = distributor.start().await {
        eprintln!("error starting distributor: {}", err);
        return ExitCode::FAILURE;
    }

    // Keep serving until the process is interrupted, then shut down.
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
    }
    distributor.close();
    ExitCode::SUCCESS
}
