//! Registry acquisition.
//!
//! Pulls a remote image into the local layout: manifest bytes are
//! fetched raw so the stored blob matches the registry digest
//! byte-for-byte, a manifest index is resolved to the host-platform
//! entry, and config/layer blobs land in the content-addressed tree.

use std::future::Future;

use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{
    OciImageManifest, OciManifest, IMAGE_MANIFEST_LIST_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE,
};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use oci_spec::image::{Descriptor, MediaType};

use lxdocker_core::digest::Digest;
use lxdocker_core::error::{LxdockerError, Result};

use super::layout::{image_descriptor, OciLayout};

const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    OCI_IMAGE_MEDIA_TYPE,
    IMAGE_MANIFEST_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE,
    IMAGE_MANIFEST_LIST_MEDIA_TYPE,
];

fn registry_err(context: &str, e: impl std::fmt::Display) -> LxdockerError {
    LxdockerError::RegistryError(format!("{context}: {e}"))
}

/// Anything that can materialize an image into the local layout.
///
/// The update controller only ever talks to this seam, so its skip,
/// rebuild, and sweep decisions can be exercised against a canned layout
/// writer instead of a live registry.
pub trait ImageSource {
    /// Fetch `reference` for `{arch, os}` into `layout` and return the
    /// index descriptor for the stored manifest, annotated with the
    /// fully-qualified reference.
    fn fetch_into(
        &self,
        layout: &OciLayout,
        reference: &Reference,
        arch: &str,
        os: &str,
    ) -> impl Future<Output = Result<Descriptor>> + Send;
}

/// Pulls images from remote registries into an [`OciLayout`].
pub struct RegistryFetcher {
    client: Client,
    auth: RegistryAuth,
}

impl Default for RegistryFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryFetcher {
    pub fn new() -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth: RegistryAuth::Anonymous,
        }
    }
}

impl ImageSource for RegistryFetcher {
    async fn fetch_into(
        &self,
        layout: &OciLayout,
        reference: &Reference,
        arch: &str,
        os: &str,
    ) -> Result<Descriptor> {
        tracing::info!(reference = %reference.whole(), os, arch, "fetching image from registry");

        let (bytes, digest) = self
            .client
            .pull_manifest_raw(reference, &self.auth, ACCEPTED_MANIFEST_TYPES)
            .await
            .map_err(|e| registry_err("pulling manifest", e))?;

        let manifest: OciManifest =
            serde_json::from_slice(&bytes).map_err(|e| registry_err("decoding manifest", e))?;

        let (bytes, digest, pull_ref) = match manifest {
            OciManifest::Image(_) => (bytes, digest, reference.clone()),
            OciManifest::ImageIndex(index) => {
                // a multi-platform index; descend to the entry for us
                let entry = index
                    .manifests
                    .iter()
                    .find(|m| {
                        m.platform
                            .as_ref()
                            .map(|p| p.architecture == arch && p.os == os)
                            .unwrap_or(false)
                    })
                    .ok_or_else(|| {
                        LxdockerError::RegistryError(format!(
                            "no {os}/{arch} manifest in index for `{}`",
                            reference.whole()
                        ))
                    })?;
                let by_digest = Reference::with_digest(
                    reference.registry().to_string(),
                    reference.repository().to_string(),
                    entry.digest.clone(),
                );
                let (bytes, digest) = self
                    .client
                    .pull_manifest_raw(&by_digest, &self.auth, ACCEPTED_MANIFEST_TYPES)
                    .await
                    .map_err(|e| registry_err("pulling platform manifest", e))?;
                (bytes, digest, by_digest)
            }
        };

        let manifest: OciImageManifest = serde_json::from_slice(&bytes)
            .map_err(|e| registry_err("decoding image manifest", e))?;

        let manifest_digest = Digest::parse(&digest)?;
        layout.write_blob(&manifest_digest, &bytes)?;

        let mut config_data = Vec::new();
        self.client
            .pull_blob(&pull_ref, &manifest.config, &mut config_data)
            .await
            .map_err(|e| registry_err("pulling config blob", e))?;
        layout.write_blob(&Digest::parse(&manifest.config.digest)?, &config_data)?;

        for layer in &manifest.layers {
            tracing::debug!(digest = %layer.digest, size = layer.size, "pulling layer");
            let mut layer_data = Vec::new();
            self.client
                .pull_blob(&pull_ref, layer, &mut layer_data)
                .await
                .map_err(|e| registry_err("pulling layer blob", e))?;
            layout.write_blob(&Digest::parse(&layer.digest)?, &layer_data)?;
        }

        let media_type = match manifest.media_type.as_deref() {
            None | Some(OCI_IMAGE_MEDIA_TYPE) => MediaType::ImageManifest,
            Some(other) => MediaType::Other(other.to_string()),
        };
        image_descriptor(
            &manifest_digest,
            bytes.len() as i64,
            media_type,
            &reference.whole(),
            arch,
            os,
        )
    }
}
