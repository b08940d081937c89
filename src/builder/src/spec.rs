//! Image spec files.
//!
//! A spec is a tiny YAML file naming one upstream image; the file stem
//! is the published product name. The file is read once into memory so
//! the digest is guaranteed to cover exactly the bytes that were parsed,
//! even if somebody rewrites the file mid-run.

use std::path::Path;

use serde::Deserialize;

use lxdocker_core::digest::Digest;
use lxdocker_core::error::{LxdockerError, Result};

/// One image spec. Unknown keys are a decode error.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageSpec {
    /// Image reference, e.g. `registry.example/app:latest`
    pub image: String,
}

impl ImageSpec {
    /// Load a spec and the digest of its raw bytes.
    pub fn load(path: impl AsRef<Path>) -> Result<(ImageSpec, Digest)> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| LxdockerError::fs(path, e))?;
        let digest = Digest::sha256_of(&bytes);
        let spec = serde_yaml::from_slice(&bytes)?;
        Ok((spec, digest))
    }
}
