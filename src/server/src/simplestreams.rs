//! Simplestreams document model.
//!
//! The wire format LXD's image downloader expects: an `index.json`
//! pointing at one products document, and the products document listing
//! versioned artifacts with hashes and sizes. Field names follow the
//! simplestreams 1.0 JSON schema exactly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `streams/v1/index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub format: String,
    pub index: BTreeMap<String, StreamIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamIndex {
    pub datatype: String,
    pub path: String,
    pub products: Vec<String>,
    pub format: String,
}

/// `streams/v1/images.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Products {
    pub content_id: String,
    pub datatype: String,
    pub format: String,
    pub products: BTreeMap<String, Product>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub aliases: String,
    pub arch: String,
    pub os: String,
    pub release_title: String,
    pub versions: BTreeMap<String, ProductVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductVersion {
    pub items: BTreeMap<String, VersionItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionItem {
    pub ftype: String,
    pub sha256: String,
    pub path: String,
    pub size: i64,
}
