//! Content digests.
//!
//! A digest is the pair `{algorithm, hex}` rendered canonically as
//! `sha256:<64 lowercase hex digits>`. Spec files, OCI manifests, and
//! generated bundles are all identified this way.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{LxdockerError, Result};

const SHA256_HEX_LEN: usize = 64;

/// A content digest with structural equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    pub algorithm: String,
    pub hex: String,
}

impl Digest {
    /// Parse a canonical `algorithm:hex` string.
    ///
    /// Only `sha256` with 64 lowercase hex digits is accepted.
    pub fn parse(input: &str) -> Result<Self> {
        let (algorithm, hex) = input
            .split_once(':')
            .ok_or_else(|| LxdockerError::DigestError(input.to_string()))?;
        if algorithm != "sha256"
            || hex.len() != SHA256_HEX_LEN
            || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(LxdockerError::DigestError(input.to_string()));
        }
        Ok(Digest {
            algorithm: algorithm.to_string(),
            hex: hex.to_string(),
        })
    }

    /// Digest of an in-memory byte slice.
    pub fn sha256_of(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Digest {
            algorithm: "sha256".to_string(),
            hex: hex::encode(hash),
        }
    }

    /// Digest of everything a reader yields.
    pub fn sha256_of_reader(mut reader: impl Read) -> Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Digest {
            algorithm: "sha256".to_string(),
            hex: hex::encode(hasher.finalize()),
        })
    }

    /// Digest of a file's contents, streamed.
    pub fn sha256_of_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| LxdockerError::fs(path, e))?;
        Self::sha256_of_reader(BufReader::new(file))
    }

    /// Shortened hex form used in human-facing version labels.
    pub fn short(&self) -> &str {
        &self.hex[..12.min(self.hex.len())]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = LxdockerError;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Digest, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}
