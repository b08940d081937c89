//! lxdocker builder - turns OCI container images into LXD image bundles.
//!
//! The pipeline: fetch an image into a local OCI layout, flatten its
//! layer stack into a single `rootfs/` tree with a generated init
//! script, and publish the result as a content-addressed gzipped tar
//! next to a YAML sidecar describing what produced it.

pub mod bundle;
pub mod flatten;
pub mod init;
pub mod oci;
pub mod spec;
pub mod update;

// Re-export common types
pub use bundle::{write_bundle, HostFiles};
pub use flatten::{flatten_layers, LayerSource, SeenPaths};
pub use oci::{ImageSource, OciImage, OciLayout, RegistryFetcher, RunConfig};
pub use spec::ImageSpec;
pub use update::{update_all, update_all_with, UpdateOptions};

/// lxdocker version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
