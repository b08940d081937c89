//! imgserver entry point.

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;

use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod catalog;
mod simplestreams;

/// Serve lxdocker images to LXD.
#[derive(Parser)]
#[command(name = "imgserver", version, about)]
struct Cli {
    /// Server listener address
    #[arg(long, value_name = "HOST:PORT", default_value = "0.0.0.0:443")]
    address: SocketAddr,

    /// Path to directory of generated LXD images
    #[arg(long, value_name = "DIR")]
    lxdimages: PathBuf,

    /// Path to TLS key (PEM)
    #[arg(long, value_name = "PATH")]
    key: PathBuf,

    /// Path to TLS certificate (PEM)
    #[arg(long, value_name = "PATH")]
    cert: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();

    let cli = Cli::parse();

    if let Err(e) = serve(cli).await {
        tracing::error!(error = %e, "server exited");
        std::process::exit(1);
    }
}

async fn serve(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let tls = RustlsConfig::from_pem_file(&cli.cert, &cli.key).await?;
    let app = catalog::router(cli.lxdimages);

    tracing::info!(address = %cli.address, "starting server");
    axum_server::bind_rustls(cli.address, tls)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}
