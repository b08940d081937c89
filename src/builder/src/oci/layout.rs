//! On-disk OCI image layout.
//!
//! The builder keeps fetched images in a standard OCI layout directory:
//! an `index.json` listing image descriptors and a content-addressed
//! `blobs/<algorithm>/<hex>` tree. Index updates are published by
//! writing a temp file next to `index.json` and renaming it into place.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use oci_spec::image::{
    Descriptor, ImageConfiguration, ImageIndex, ImageIndexBuilder, ImageManifest, MediaType,
};

use lxdocker_core::digest::Digest;
use lxdocker_core::error::{LxdockerError, Result};

use super::image::{BlobLayer, OciImage};

/// Annotation carrying the fully-qualified reference an index entry was
/// fetched for.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

fn registry_err(context: &str, e: impl std::fmt::Display) -> LxdockerError {
    LxdockerError::RegistryError(format!("{context}: {e}"))
}

/// True for descriptors that point at an image manifest (OCI or Docker).
pub fn is_image_descriptor(descriptor: &Descriptor) -> bool {
    match descriptor.media_type() {
        MediaType::ImageManifest => true,
        MediaType::Other(s) => s == DOCKER_MANIFEST_MEDIA_TYPE,
        _ => false,
    }
}

/// True when a descriptor was stored for `reference` on `{arch, os}`.
pub fn descriptor_matches(descriptor: &Descriptor, reference: &str, arch: &str, os: &str) -> bool {
    let name_matches = descriptor
        .annotations()
        .as_ref()
        .and_then(|a| a.get(REF_NAME_ANNOTATION))
        .map(|name| name == reference)
        .unwrap_or(false);
    let platform_matches = descriptor
        .platform()
        .as_ref()
        .map(|p| p.architecture().to_string() == arch && p.os().to_string() == os)
        .unwrap_or(false);
    name_matches && platform_matches
}

/// Handle on the layout directory.
pub struct OciLayout {
    root: PathBuf,
}

impl OciLayout {
    /// Open an existing layout, or initialize an empty one.
    pub fn open_or_init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let layout = Self { root };
        if !layout.root.join("index.json").exists() {
            fs::create_dir_all(layout.root.join("blobs"))
                .map_err(|e| LxdockerError::fs(layout.root.join("blobs"), e))?;
            fs::write(layout.root.join("oci-layout"), OCI_LAYOUT_CONTENT)
                .map_err(|e| LxdockerError::fs(layout.root.join("oci-layout"), e))?;
            let index = ImageIndexBuilder::default()
                .schema_version(2u32)
                .media_type(MediaType::ImageIndex)
                .manifests(Vec::new())
                .build()
                .map_err(|e| registry_err("building empty index", e))?;
            layout.write_index(&index)?;
        }
        Ok(layout)
    }

    pub fn index(&self) -> Result<ImageIndex> {
        ImageIndex::from_file(self.root.join("index.json"))
            .map_err(|e| registry_err("reading index.json", e))
    }

    /// Publish a new index via temp file + rename.
    fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let text =
            serde_json::to_string(index).map_err(|e| registry_err("encoding index.json", e))?;
        let mut tmp = tempfile::Builder::new()
            .prefix("index.json")
            .tempfile_in(&self.root)
            .map_err(|e| LxdockerError::fs(&self.root, e))?;
        tmp.write_all(text.as_bytes())
            .map_err(|e| LxdockerError::fs(tmp.path().to_path_buf(), e))?;
        tmp.persist(self.root.join("index.json"))
            .map_err(|e| LxdockerError::fs(self.root.join("index.json"), e.error))?;
        Ok(())
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(&digest.algorithm)
            .join(&digest.hex)
    }

    /// Store blob bytes under a registry-assigned digest. Existing blobs
    /// are left untouched (content-addressed, so identical by
    /// definition).
    pub fn write_blob(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        let path = self.blob_path(digest);
        if path.exists() {
            return Ok(());
        }
        let dir = path.parent().expect("blob path has a parent");
        fs::create_dir_all(dir).map_err(|e| LxdockerError::fs(dir, e))?;
        let mut tmp = tempfile::Builder::new()
            .prefix(&digest.hex[..12])
            .tempfile_in(dir)
            .map_err(|e| LxdockerError::fs(dir, e))?;
        tmp.write_all(data)
            .map_err(|e| LxdockerError::fs(tmp.path().to_path_buf(), e))?;
        tmp.persist(&path)
            .map_err(|e| LxdockerError::fs(&path, e.error))?;
        Ok(())
    }

    /// Replace any index entries matching `descriptor`'s reference
    /// annotation and platform with `descriptor`.
    pub fn replace_image(&self, descriptor: Descriptor) -> Result<()> {
        let reference = descriptor
            .annotations()
            .as_ref()
            .and_then(|a| a.get(REF_NAME_ANNOTATION))
            .cloned()
            .ok_or_else(|| {
                LxdockerError::RegistryError("descriptor has no reference annotation".to_string())
            })?;
        let platform = descriptor.platform().as_ref().ok_or_else(|| {
            LxdockerError::RegistryError("descriptor has no platform".to_string())
        })?;
        let (arch, os) = (platform.architecture().to_string(), platform.os().to_string());

        let index = self.index()?;
        let mut manifests: Vec<Descriptor> = index
            .manifests()
            .iter()
            .filter(|d| !descriptor_matches(d, &reference, &arch, &os))
            .cloned()
            .collect();
        manifests.push(descriptor);

        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageIndex)
            .manifests(manifests)
            .build()
            .map_err(|e| registry_err("rebuilding index", e))?;
        self.write_index(&index)
    }

    /// Load the first image stored for `reference` on `{arch, os}`.
    pub fn find_image(&self, reference: &str, arch: &str, os: &str) -> Result<OciImage> {
        let index = self.index()?;
        let descriptor = index
            .manifests()
            .iter()
            .find(|d| descriptor_matches(d, reference, arch, os))
            .ok_or_else(|| {
                LxdockerError::RegistryError(format!(
                    "no image for `{reference}` ({os}/{arch}) in layout"
                ))
            })?;
        self.image(descriptor)
    }

    /// Load the image a descriptor points at.
    pub fn image(&self, descriptor: &Descriptor) -> Result<OciImage> {
        let digest = Digest::parse(descriptor.digest())?;
        let manifest = ImageManifest::from_file(self.blob_path(&digest))
            .map_err(|e| registry_err("reading image manifest", e))?;
        let config_digest = Digest::parse(manifest.config().digest())?;
        let config = ImageConfiguration::from_file(self.blob_path(&config_digest))
            .map_err(|e| registry_err("reading image config", e))?;
        let layers = manifest
            .layers()
            .iter()
            .map(|l| {
                Ok(BlobLayer {
                    path: self.blob_path(&Digest::parse(l.digest())?),
                    media_type: l.media_type().clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(OciImage {
            digest,
            manifest,
            config,
            layers,
        })
    }

    /// Detach image descriptors whose digest is not in `used`.
    pub fn remove_unused_images(&self, used: &HashSet<Digest>) -> Result<()> {
        let index = self.index()?;
        let mut manifests = Vec::new();
        for descriptor in index.manifests() {
            let digest = Digest::parse(descriptor.digest())?;
            if is_image_descriptor(descriptor) && !used.contains(&digest) {
                tracing::debug!(digest = %digest, "detaching unused image from index");
                continue;
            }
            manifests.push(descriptor.clone());
        }
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageIndex)
            .manifests(manifests)
            .build()
            .map_err(|e| registry_err("rebuilding index", e))?;
        self.write_index(&index)
    }

    /// Every blob digest still reachable from the index: the listed
    /// descriptors themselves plus, per image, its config blob, layer
    /// blobs, and uncompressed diff ids.
    pub fn reachable_blobs(&self) -> Result<HashSet<Digest>> {
        let mut blobs = HashSet::new();
        let index = self.index()?;
        for descriptor in index.manifests() {
            let digest = Digest::parse(descriptor.digest())?;
            blobs.insert(digest);
            if !is_image_descriptor(descriptor) {
                continue;
            }
            let image = self.image(descriptor)?;
            blobs.insert(image.config_digest()?);
            blobs.extend(image.layer_digests()?);
            blobs.extend(image.diff_ids()?);
        }
        Ok(blobs)
    }

    /// Delete every blob file whose digest is not in `reachable`.
    pub fn sweep_blobs(&self, reachable: &HashSet<Digest>) -> Result<()> {
        let blobs_dir = self.root.join("blobs");
        let algorithms =
            fs::read_dir(&blobs_dir).map_err(|e| LxdockerError::fs(&blobs_dir, e))?;
        for algorithm in algorithms {
            let algorithm = algorithm.map_err(|e| LxdockerError::fs(&blobs_dir, e))?;
            if !algorithm.path().is_dir() {
                continue;
            }
            let algorithm_name = algorithm.file_name().to_string_lossy().into_owned();
            let entries = fs::read_dir(algorithm.path())
                .map_err(|e| LxdockerError::fs(algorithm.path(), e))?;
            for entry in entries {
                let entry = entry.map_err(|e| LxdockerError::fs(algorithm.path(), e))?;
                if !entry.path().is_file() {
                    continue;
                }
                let digest = Digest {
                    algorithm: algorithm_name.clone(),
                    hex: entry.file_name().to_string_lossy().into_owned(),
                };
                if reachable.contains(&digest) {
                    continue;
                }
                tracing::info!(digest = %digest, "deleting unused blob");
                fs::remove_file(entry.path())
                    .map_err(|e| LxdockerError::fs(entry.path(), e))?;
            }
        }
        Ok(())
    }
}

/// Build an annotated image descriptor for the index.
pub fn image_descriptor(
    digest: &Digest,
    size: i64,
    media_type: MediaType,
    reference: &str,
    arch: &str,
    os: &str,
) -> Result<Descriptor> {
    use oci_spec::image::{Arch, DescriptorBuilder, Os, PlatformBuilder};

    let platform = PlatformBuilder::default()
        .architecture(Arch::from(arch))
        .os(Os::from(os))
        .build()
        .map_err(|e| registry_err("building platform", e))?;
    let mut annotations = HashMap::new();
    annotations.insert(REF_NAME_ANNOTATION.to_string(), reference.to_string());
    DescriptorBuilder::default()
        .media_type(media_type)
        .digest(digest.to_string())
        .size(size)
        .platform(platform)
        .annotations(annotations)
        .build()
        .map_err(|e| registry_err("building descriptor", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest_json(config_digest: &Digest, layer_digest: &Digest, layer_size: i64) -> String {
        format!(
            r#"{{
                "schemaVersion": 2,
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "config": {{
                    "mediaType": "application/vnd.oci.image.config.v1+json",
                    "digest": "{config_digest}",
                    "size": 2
                }},
                "layers": [{{
                    "mediaType": "application/vnd.oci.image.layer.v1.tar",
                    "digest": "{layer_digest}",
                    "size": {layer_size}
                }}]
            }}"#
        )
    }

    fn config_json(diff_id: &Digest) -> String {
        format!(
            r#"{{
                "architecture": "amd64",
                "os": "linux",
                "config": {{"Cmd": ["/bin/sh"]}},
                "rootfs": {{"type": "layers", "diff_ids": ["{diff_id}"]}},
                "history": []
            }}"#
        )
    }

    /// Store a complete synthetic image and return its descriptor. The
    /// blob contents are derived from the reference so distinct
    /// references get distinct digests.
    fn store_image(layout: &OciLayout, reference: &str) -> Descriptor {
        let layer_data = format!("layer-bytes-{reference}").into_bytes();
        let layer_digest = Digest::sha256_of(&layer_data);
        layout.write_blob(&layer_digest, &layer_data).unwrap();

        let diff_id = Digest::sha256_of(format!("uncompressed-{reference}").as_bytes());
        let config = config_json(&diff_id);
        let config_digest = Digest::sha256_of(config.as_bytes());
        layout.write_blob(&config_digest, config.as_bytes()).unwrap();

        let manifest = manifest_json(&config_digest, &layer_digest, layer_data.len() as i64);
        let manifest_digest = Digest::sha256_of(manifest.as_bytes());
        layout
            .write_blob(&manifest_digest, manifest.as_bytes())
            .unwrap();

        let descriptor = image_descriptor(
            &manifest_digest,
            manifest.len() as i64,
            MediaType::ImageManifest,
            reference,
            "amd64",
            "linux",
        )
        .unwrap();
        layout.replace_image(descriptor.clone()).unwrap();
        descriptor
    }

    #[test]
    fn test_open_or_init_creates_layout() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open_or_init(dir.path()).unwrap();
        assert!(dir.path().join("oci-layout").exists());
        assert!(dir.path().join("index.json").exists());
        assert!(layout.index().unwrap().manifests().is_empty());
    }

    #[test]
    fn test_replace_image_drops_older_entry_for_same_reference() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open_or_init(dir.path()).unwrap();

        store_image(&layout, "registry.invalid/app:latest");
        let index = layout.index().unwrap();
        assert_eq!(index.manifests().len(), 1);

        // replacing with a new descriptor for the same reference keeps
        // a single entry
        let other_digest = Digest::sha256_of(b"other-manifest");
        let descriptor = image_descriptor(
            &other_digest,
            10,
            MediaType::ImageManifest,
            "registry.invalid/app:latest",
            "amd64",
            "linux",
        )
        .unwrap();
        layout.replace_image(descriptor).unwrap();

        let index = layout.index().unwrap();
        assert_eq!(index.manifests().len(), 1);
        assert_eq!(
            index.manifests()[0].digest().as_str(),
            other_digest.to_string()
        );
    }

    #[test]
    fn test_replace_image_keeps_other_references() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open_or_init(dir.path()).unwrap();
        store_image(&layout, "registry.invalid/a:latest");
        store_image(&layout, "registry.invalid/b:latest");
        assert_eq!(layout.index().unwrap().manifests().len(), 2);
    }

    #[test]
    fn test_find_image_loads_manifest_and_config() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open_or_init(dir.path()).unwrap();
        let descriptor = store_image(&layout, "registry.invalid/app:latest");

        let image = layout
            .find_image("registry.invalid/app:latest", "amd64", "linux")
            .unwrap();
        assert_eq!(image.digest().to_string(), descriptor.digest().as_str());
        assert_eq!(image.layers().len(), 1);
        assert_eq!(image.run_config().cmd, vec!["/bin/sh"]);
    }

    #[test]
    fn test_find_image_respects_platform() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open_or_init(dir.path()).unwrap();
        store_image(&layout, "registry.invalid/app:latest");
        assert!(layout
            .find_image("registry.invalid/app:latest", "arm64", "linux")
            .is_err());
    }

    #[test]
    fn test_remove_unused_images_and_sweep_blobs() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open_or_init(dir.path()).unwrap();
        let keep = store_image(&layout, "registry.invalid/keep:latest");
        store_image(&layout, "registry.invalid/drop:latest");

        let keep_digest = Digest::parse(keep.digest()).unwrap();
        let mut used = HashSet::new();
        used.insert(keep_digest.clone());
        layout.remove_unused_images(&used).unwrap();

        let index = layout.index().unwrap();
        assert_eq!(index.manifests().len(), 1);
        assert_eq!(index.manifests()[0].digest().as_str(), keep_digest.to_string());

        let reachable = layout.reachable_blobs().unwrap();
        layout.sweep_blobs(&reachable).unwrap();

        // the kept image's blobs survive
        let image = layout
            .find_image("registry.invalid/keep:latest", "amd64", "linux")
            .unwrap();
        assert!(layout.blob_path(image.digest()).exists());
        assert!(layout.blob_path(&image.config_digest().unwrap()).exists());
        for layer in image.layer_digests().unwrap() {
            assert!(layout.blob_path(&layer).exists());
        }
    }

    #[test]
    fn test_sweep_blobs_removes_unreachable() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open_or_init(dir.path()).unwrap();
        let orphan = Digest::sha256_of(b"orphan");
        layout.write_blob(&orphan, b"orphan").unwrap();

        layout.sweep_blobs(&HashSet::new()).unwrap();
        assert!(!layout.blob_path(&orphan).exists());
    }

    #[test]
    fn test_reachable_includes_diff_ids() {
        let dir = TempDir::new().unwrap();
        let layout = OciLayout::open_or_init(dir.path()).unwrap();
        store_image(&layout, "registry.invalid/app:latest");

        let reachable = layout.reachable_blobs().unwrap();
        let diff_id = Digest::sha256_of(b"uncompressed-registry.invalid/app:latest");
        assert!(reachable.contains(&diff_id));
    }
}
