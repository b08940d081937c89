//! Local OCI layout management and registry acquisition.

pub mod fetch;
pub mod image;
pub mod layout;

pub use fetch::{ImageSource, RegistryFetcher};
pub use image::{BlobLayer, OciImage, RunConfig};
pub use layout::OciLayout;
