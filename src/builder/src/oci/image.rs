//! Loaded OCI image handles.
//!
//! An [`OciImage`] is the builder's view of one image inside the local
//! layout: its manifest digest, its parsed configuration, and the layer
//! blobs in application order (base first).

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

use flate2::read::GzDecoder;
use oci_spec::image::{ImageConfiguration, ImageManifest, MediaType};

use lxdocker_core::digest::Digest;
use lxdocker_core::error::{LxdockerError, Result};

use crate::flatten::LayerSource;

/// The parts of an image configuration the init script and bundle
/// manifest are generated from.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub architecture: String,
    pub env: Vec<String>,
    pub working_dir: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
}

impl RunConfig {
    pub fn from_image_configuration(config: &ImageConfiguration) -> Self {
        let c = config.config().as_ref();
        RunConfig {
            architecture: config.architecture().to_string(),
            env: c.and_then(|c| c.env().clone()).unwrap_or_default(),
            working_dir: c.and_then(|c| c.working_dir().clone()).unwrap_or_default(),
            entrypoint: c.and_then(|c| c.entrypoint().clone()).unwrap_or_default(),
            cmd: c.and_then(|c| c.cmd().clone()).unwrap_or_default(),
        }
    }
}

/// One layer blob on disk, openable as an uncompressed tar stream.
#[derive(Debug)]
pub struct BlobLayer {
    pub(crate) path: PathBuf,
    pub(crate) media_type: MediaType,
}

impl LayerSource for BlobLayer {
    fn open(&self) -> Result<Box<dyn Read>> {
        let file = File::open(&self.path).map_err(|e| LxdockerError::fs(&self.path, e))?;
        let reader = BufReader::new(file);
        let media = self.media_type.to_string();
        if media.ends_with("tar+gzip") || media.ends_with("tar.gzip") {
            Ok(Box::new(GzDecoder::new(reader)))
        } else if media.ends_with("tar") {
            Ok(Box::new(reader))
        } else {
            Err(LxdockerError::ArchiveError(format!(
                "unsupported layer media type `{media}`"
            )))
        }
    }
}

/// An image resolved inside the local OCI layout.
#[derive(Debug)]
pub struct OciImage {
    pub(crate) digest: Digest,
    pub(crate) manifest: ImageManifest,
    pub(crate) config: ImageConfiguration,
    pub(crate) layers: Vec<BlobLayer>,
}

impl OciImage {
    /// Digest of the image manifest. This is the identity the update
    /// cycle compares against the stored sidecar.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig::from_image_configuration(&self.config)
    }

    /// Layer blobs in application order, base first.
    pub fn layers(&self) -> &[BlobLayer] {
        &self.layers
    }

    /// Digest of the config blob.
    pub fn config_digest(&self) -> Result<Digest> {
        Digest::parse(self.manifest.config().digest())
    }

    /// Digests of the (compressed) layer blobs.
    pub fn layer_digests(&self) -> Result<Vec<Digest>> {
        self.manifest
            .layers()
            .iter()
            .map(|l| Digest::parse(l.digest()))
            .collect()
    }

    /// Uncompressed layer digests from the config's rootfs section.
    pub fn diff_ids(&self) -> Result<Vec<Digest>> {
        self.config
            .rootfs()
            .diff_ids()
            .iter()
            .map(|d| Digest::parse(d))
            .collect()
    }
}
