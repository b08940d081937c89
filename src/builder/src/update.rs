//! Update orchestration.
//!
//! Walks the spec directory, brings every image's bundle up to date, and
//! then garbage-collects the three stores: sidecar metadata, bundles,
//! and the OCI layout. A spec is rebuilt only when its own bytes or the
//! upstream manifest digest changed; everything else is a skip.
//!
//! Per-spec failures are contained — the run continues and the sweep
//! still executes, with the failing spec's previous artifacts kept alive
//! through its old sidecar so a transient registry error never deletes a
//! published image.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use oci_distribution::Reference;

use lxdocker_core::digest::Digest;
use lxdocker_core::error::{LxdockerError, Result};
use lxdocker_core::metadata::RootfsMetadata;
use lxdocker_core::platform::{host_arch, host_os};

use crate::bundle::{write_bundle, HostFiles};
use crate::oci::{ImageSource, OciLayout, RegistryFetcher};
use crate::spec::ImageSpec;

/// Directories and host files an update run operates on.
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// OCI layout cache directory
    pub oci_dir: PathBuf,
    /// Spec directory
    pub spec_dir: PathBuf,
    /// Destination for bundles and sidecars
    pub image_dir: PathBuf,
    /// Host helpers copied into every bundle
    pub host_files: HostFiles,
}

/// Artifacts that survived the run and must not be swept.
#[derive(Debug, Default)]
struct UsedSets {
    metadata: HashSet<String>,
    bundles: HashSet<String>,
    oci: HashSet<Digest>,
}

/// Process every spec against the live registry, then sweep.
pub async fn update_all(opts: &UpdateOptions) -> Result<()> {
    update_all_with(opts, &RegistryFetcher::new()).await
}

/// Process every spec using `source`, then sweep all three stores.
pub async fn update_all_with<S: ImageSource>(opts: &UpdateOptions, source: &S) -> Result<()> {
    let layout = OciLayout::open_or_init(&opts.oci_dir)?;
    let mut used = UsedSets::default();

    for path in spec_files(&opts.spec_dir)? {
        let name = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => stem.to_string(),
            None => continue,
        };
        used.metadata.insert(name.clone());
        let meta_path = opts.image_dir.join(format!("{name}.meta"));

        if let Err(e) = process_spec(opts, &layout, source, &path, &name, &meta_path, &mut used)
            .await
        {
            tracing::error!(spec = %name, error = %e, "failed to update spec");
            // a decodable old sidecar keeps its artifacts alive so a
            // transient failure does not garbage-collect them
            if let Ok(old) = RootfsMetadata::read(&meta_path) {
                used.oci.insert(old.oci_image_digest);
                used.bundles.insert(old.filename);
            }
        }
    }

    tracing::info!("sweeping unused metadata");
    sweep_metadata(&opts.image_dir, &used.metadata)?;

    tracing::info!("sweeping unused bundles");
    sweep_bundles(&opts.image_dir, &used.bundles)?;

    tracing::info!("sweeping unused OCI images and blobs");
    layout.remove_unused_images(&used.oci)?;
    let reachable = layout.reachable_blobs()?;
    layout.sweep_blobs(&reachable)?;

    Ok(())
}

/// Spec files (`.yaml`/`.yml`) in sorted filename order.
fn spec_files(spec_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(spec_dir).map_err(|e| LxdockerError::fs(spec_dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LxdockerError::fs(spec_dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => files.push(path),
            _ => {}
        }
    }
    files.sort();
    Ok(files)
}

async fn process_spec<S: ImageSource>(
    opts: &UpdateOptions,
    layout: &OciLayout,
    source: &S,
    spec_path: &Path,
    name: &str,
    meta_path: &Path,
    used: &mut UsedSets,
) -> Result<()> {
    let (spec, spec_digest) = ImageSpec::load(spec_path).map_err(|e| {
        LxdockerError::SpecError {
            name: name.to_string(),
            message: e.to_string(),
        }
    })?;

    let reference: Reference = spec
        .image
        .parse()
        .map_err(|e| LxdockerError::RegistryError(format!("parsing `{}`: {e}", spec.image)))?;
    let (arch, os) = (host_arch(), host_os());

    let descriptor = source.fetch_into(layout, &reference, arch, os).await?;
    layout.replace_image(descriptor)?;
    let image = layout.find_image(&reference.whole(), arch, os)?;
    let oci_digest = image.digest().clone();

    if let Ok(old) = RootfsMetadata::read(meta_path) {
        if old.spec_digest == spec_digest && old.oci_image_digest == oci_digest {
            tracing::info!(spec = %name, "unchanged, skipping");
            used.oci.insert(oci_digest);
            used.bundles.insert(old.filename);
            return Ok(());
        }
    }

    let config = image.run_config();
    let (bundle_digest, filename) = write_bundle(
        &opts.image_dir,
        name,
        &config,
        image.layers(),
        &opts.host_files,
    )?;

    let meta = RootfsMetadata {
        spec_digest,
        oci_image_digest: oci_digest.clone(),
        lxd_image_digest: bundle_digest,
        filename: filename.clone(),
    };
    meta.write(meta_path)?;

    used.oci.insert(oci_digest);
    used.bundles.insert(filename);
    Ok(())
}

/// Delete `.meta` files whose stem is not a current spec name.
fn sweep_metadata(image_dir: &Path, used: &HashSet<String>) -> Result<()> {
    for path in files_with_extension(image_dir, "meta")? {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        if used.contains(stem) {
            continue;
        }
        tracing::debug!(path = %path.display(), "deleting unused metadata");
        fs::remove_file(&path).map_err(|e| LxdockerError::fs(&path, e))?;
    }
    Ok(())
}

/// Delete `.rootfs` files whose full name no sidecar references.
fn sweep_bundles(image_dir: &Path, used: &HashSet<String>) -> Result<()> {
    for path in files_with_extension(image_dir, "rootfs")? {
        let filename = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        if used.contains(filename) {
            continue;
        }
        tracing::debug!(path = %path.display(), "deleting unused bundle");
        fs::remove_file(&path).map_err(|e| LxdockerError::fs(&path, e))?;
    }
    Ok(())
}

fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| LxdockerError::fs(dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LxdockerError::fs(dir, e))?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
