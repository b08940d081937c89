//! lxdocker entry point.

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use lxdocker_builder::{update_all, HostFiles, UpdateOptions};
use lxdocker_core::error::LxdockerError;

/// Generate LXD images from Docker containers.
#[derive(Parser)]
#[command(name = "lxdocker", version, about)]
struct Cli {
    /// Path to the OCI cache
    #[arg(long, value_name = "DIR")]
    cache: PathBuf,

    /// Path to the directory for generated LXD images
    #[arg(long, value_name = "DIR")]
    lxdimages: PathBuf,

    /// Path to the directory with LXD image specifications
    #[arg(long, value_name = "DIR")]
    specs: PathBuf,

    /// Host busybox binary bundled into every image
    #[arg(long, value_name = "PATH", default_value = "/tmp/busybox")]
    busybox: PathBuf,

    /// Host udhcpc script bundled into every image
    #[arg(long, value_name = "PATH", default_value = "/tmp/default.script")]
    udhcpc_script: PathBuf,
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

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "update failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> lxdocker_core::Result<()> {
    std::fs::create_dir_all(&cli.lxdimages)
        .map_err(|e| LxdockerError::fs(&cli.lxdimages, e))?;

    tracing::info!("updating all images");
    update_all(&UpdateOptions {
        oci_dir: cli.cache,
        spec_dir: cli.specs,
        image_dir: cli.lxdimages,
        host_files: HostFiles {
            busybox: cli.busybox,
            udhcpc_script: cli.udhcpc_script,
        },
    })
    .await?;

    tracing::info!("done");
    Ok(())
}
