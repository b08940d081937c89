//! Host platform naming in OCI vocabulary.
//!
//! OCI descriptors use Go-style architecture names (`amd64`, `arm64`),
//! not the Rust target names.

/// Host architecture as it appears in OCI platform descriptors.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "arm" => "arm",
        "riscv64" => "riscv64",
        "s390x" => "s390x",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// Host operating system as it appears in OCI platform descriptors.
pub fn host_os() -> &'static str {
    std::env::consts::OS
}
