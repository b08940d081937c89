//! Bundle generation.
//!
//! A bundle is a gzipped tar: `metadata.yaml` at the archive root and
//! everything else (host helpers, generated init, merged image content)
//! under `rootfs/`. The file is staged inside the destination directory
//! and renamed to its content-addressed final name, so a bundle is
//! either invisible or complete.

use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tar::{Builder, EntryType, Header};

use lxdocker_core::digest::Digest;
use lxdocker_core::error::{LxdockerError, Result};

use crate::flatten::{
    append_host_file, append_synthesized, flatten_layers, LayerSource, SeenPaths,
};
use crate::init;
use crate::oci::image::RunConfig;

pub const BUSYBOX_DEST: &str = "busybox-lxd";
pub const UDHCPC_SCRIPT_DEST: &str = "lxd-udhcpc-default.script";
pub const INIT_DEST: &str = "sbin/init";
pub const MANIFEST_DEST: &str = "metadata.yaml";

/// Host helper binaries copied into every bundle.
#[derive(Debug, Clone)]
pub struct HostFiles {
    pub busybox: PathBuf,
    pub udhcpc_script: PathBuf,
}

/// The `metadata.yaml` manifest LXD reads from the bundle root.
#[derive(Debug, Serialize)]
struct BundleManifest {
    architecture: String,
    creation_date: i64,
    properties: BundleProperties,
}

#[derive(Debug, Serialize)]
struct BundleProperties {
    description: String,
}

fn archive_err(context: &str, e: impl std::fmt::Display) -> LxdockerError {
    LxdockerError::ArchiveError(format!("{context}: {e}"))
}

/// Write the bundle for `name` into `image_dir` and return its digest
/// and final basename (`<name>-<hex>.rootfs`).
pub fn write_bundle<L: LayerSource>(
    image_dir: &Path,
    name: &str,
    config: &RunConfig,
    layers: &[L],
    host: &HostFiles,
) -> Result<(Digest, String)> {
    let tmp = tempfile::Builder::new()
        .prefix(name)
        .tempfile_in(image_dir)
        .map_err(|e| LxdockerError::fs(image_dir, e))?;
    tracing::info!(spec = name, path = %tmp.path().display(), "generating rootfs bundle");

    {
        let gz = GzEncoder::new(tmp.as_file(), Compression::default());
        let mut tar = Builder::new(gz);
        let mut seen = SeenPaths::new();

        append_host_file(&mut tar, &mut seen, BUSYBOX_DEST, &host.busybox, 0o755)?;
        append_host_file(
            &mut tar,
            &mut seen,
            UDHCPC_SCRIPT_DEST,
            &host.udhcpc_script,
            0o755,
        )?;
        append_manifest(&mut tar, &mut seen, name, &config.architecture)?;
        append_synthesized(
            &mut tar,
            &mut seen,
            INIT_DEST,
            0o755,
            init::render(config).as_bytes(),
        )?;
        flatten_layers(&mut tar, &mut seen, layers)?;

        let gz = tar
            .into_inner()
            .map_err(|e| archive_err("finishing tar", e))?;
        gz.finish().map_err(|e| archive_err("finishing gzip", e))?;
    }

    // rehash from disk so the name reflects exactly what was written
    let digest = Digest::sha256_of_file(tmp.path())?;
    let filename = format!("{name}-{}.rootfs", digest.hex);
    let dest = image_dir.join(&filename);

    // the bundle may already exist when only the metadata changed; the
    // rename silently replaces it with identical content
    tmp.persist(&dest)
        .map_err(|e| LxdockerError::fs(&dest, e.error))?;

    Ok((digest, filename))
}

/// Write `metadata.yaml` at the archive root and reserve the name so no
/// image layer can supply one.
fn append_manifest<W: std::io::Write>(
    tar: &mut Builder<W>,
    seen: &mut SeenPaths,
    name: &str,
    architecture: &str,
) -> Result<()> {
    let manifest = BundleManifest {
        architecture: architecture.to_string(),
        creation_date: chrono::Utc::now().timestamp(),
        properties: BundleProperties {
            description: name.to_string(),
        },
    };
    let data = serde_yaml::to_string(&manifest)?;

    crate::flatten::reserve(seen, MANIFEST_DEST);
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_size(data.len() as u64);
    tar.append_data(&mut header, MANIFEST_DEST, data.as_bytes())
        .map_err(|e| archive_err(MANIFEST_DEST, e))?;
    Ok(())
}
