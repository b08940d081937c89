//! lxdocker core - shared types for the builder and the catalog server.
//!
//! This crate holds the pieces both executables agree on: the content
//! digest type, the rootfs sidecar metadata record, host platform
//! naming, and the workspace error type.

pub mod digest;
pub mod error;
pub mod metadata;
pub mod platform;

// Re-export commonly used types
pub use digest::Digest;
pub use error::{LxdockerError, Result};
pub use metadata::RootfsMetadata;
pub use platform::{host_arch, host_os};

/// lxdocker version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
