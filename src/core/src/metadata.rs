//! Rootfs sidecar metadata.
//!
//! Every generated bundle gets a `<name>.meta` YAML sidecar recording the
//! digests that produced it. The builder decides whether a rebuild is
//! needed by comparing the stored `(SpecDigest, OciImageDigest)` pair,
//! and the catalog server resolves bundle files through `Filename`.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{LxdockerError, Result};

/// Per-spec record tying a spec, the OCI image it resolved to, and the
/// generated bundle together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RootfsMetadata {
    /// sha256 of the spec file bytes
    #[serde(rename = "SpecDigest")]
    pub spec_digest: Digest,

    /// Manifest digest of the fetched OCI image
    #[serde(rename = "OciImageDigest")]
    pub oci_image_digest: Digest,

    /// sha256 of the generated bundle file
    #[serde(rename = "LxdImageDigest")]
    pub lxd_image_digest: Digest,

    /// Bundle basename on disk
    #[serde(rename = "Filename")]
    pub filename: String,
}

impl RootfsMetadata {
    /// Read and strictly decode a sidecar file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| LxdockerError::fs(path, e))?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Publish the record at `path` via a temp file in the same
    /// directory and a single rename.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let dir = path.parent().ok_or_else(|| {
            LxdockerError::ConfigError(format!("no parent directory for {}", path.display()))
        })?;
        let text = serde_yaml::to_string(self)?;

        let prefix = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut tmp = tempfile::Builder::new()
            .prefix(&prefix)
            .tempfile_in(dir)
            .map_err(|e| LxdockerError::fs(dir, e))?;
        tmp.write_all(text.as_bytes())
            .map_err(|e| LxdockerError::fs(tmp.path().to_path_buf(), e))?;
        tmp.persist(path)
            .map_err(|e| LxdockerError::fs(path, e.error))?;
        Ok(())
    }
}
