//! Catalog construction and request handlers.
//!
//! The server is a pure reader over the builder's image directory.
//! Sidecars and bundles appear there only via atomic rename, so anything
//! visible is complete; a sidecar without its bundle (or vice versa) is
//! a transient state and simply skipped.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path as UrlPath, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use tokio_util::io::ReaderStream;

use lxdocker_core::metadata::RootfsMetadata;
use lxdocker_core::platform::host_arch;

use crate::simplestreams::{Product, Products, ProductVersion, Stream, StreamIndex, VersionItem};

const IMAGES_JSON_PATH: &str = "streams/v1/images.json";

/// Read-only view of the image directory.
pub struct Catalog {
    images_dir: PathBuf,
}

impl Catalog {
    pub fn new(images_dir: impl Into<PathBuf>) -> Self {
        Self {
            images_dir: images_dir.into(),
        }
    }

    /// Sidecar files as `(product name, path)`, sorted by name.
    fn sidecars(&self) -> std::io::Result<Vec<(String, PathBuf)>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.images_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                found.push((stem.to_string(), path.clone()));
            }
        }
        found.sort();
        Ok(found)
    }

    /// Build the index document.
    pub fn index(&self) -> std::io::Result<Stream> {
        let products = self
            .sidecars()?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        Ok(Stream {
            format: "index:1.0".to_string(),
            index: BTreeMap::from([(
                "images".to_string(),
                StreamIndex {
                    datatype: "image-downloads".to_string(),
                    path: IMAGES_JSON_PATH.to_string(),
                    products,
                    format: "products:1.0".to_string(),
                },
            )]),
        })
    }

    /// Build the products document. Sidecars that fail to stat, decode,
    /// or resolve to a bundle are logged and left out.
    pub fn products(&self) -> std::io::Result<Products> {
        let mut products = BTreeMap::new();
        for (name, path) in self.sidecars()? {
            let stat = match std::fs::metadata(&path) {
                Ok(stat) => stat,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "failed to stat sidecar");
                    continue;
                }
            };
            let meta = match RootfsMetadata::read(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "failed to read sidecar");
                    continue;
                }
            };
            let bundle_stat = match std::fs::metadata(self.images_dir.join(&meta.filename)) {
                Ok(stat) => stat,
                Err(e) => {
                    tracing::error!(bundle = %meta.filename, error = %e, "failed to stat bundle");
                    continue;
                }
            };

            let modified: DateTime<Utc> = stat
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            let version = format!(
                "{}_{}",
                modified.format("%Y%m%d"),
                meta.lxd_image_digest.short()
            );

            products.insert(
                name.clone(),
                Product {
                    aliases: format!("{name}/current/default,{name}/current,{name}"),
                    arch: host_arch().to_string(),
                    os: format!("docker:{name}"),
                    release_title: "latest".to_string(),
                    versions: BTreeMap::from([(
                        version,
                        ProductVersion {
                            items: BTreeMap::from([(
                                "lxd_combined.tar.gz".to_string(),
                                VersionItem {
                                    ftype: "lxd_combined.tar.gz".to_string(),
                                    sha256: meta.lxd_image_digest.hex.clone(),
                                    path: format!("images/{}", meta.filename),
                                    size: bundle_stat.len() as i64,
                                },
                            )]),
                        },
                    )]),
                },
            );
        }
        Ok(Products {
            content_id: "images".to_string(),
            datatype: "image-downloads".to_string(),
            format: "products-1.0".to_string(),
            products,
        })
    }

    /// Resolve a requested bundle basename, rejecting anything that is
    /// not a single `.rootfs` path segment.
    pub fn bundle_path(&self, filename: &str) -> Option<PathBuf> {
        let candidate = Path::new(filename);
        let mut components = candidate.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return None,
        }
        if candidate.extension().and_then(|e| e.to_str()) != Some("rootfs") {
            return None;
        }
        Some(self.images_dir.join(filename))
    }
}

/// Build the application router.
pub fn router(images_dir: PathBuf) -> Router {
    Router::new()
        .route("/streams/v1/index.json", get(index_json))
        .route("/streams/v1/images.json", get(images_json))
        .route("/images/:filename", get(serve_bundle))
        .layer(middleware::from_fn(log_requests))
        .with_state(Arc::new(Catalog::new(images_dir)))
}

async fn log_requests(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    tracing::info!(peer = %peer, method = %request.method(), uri = %request.uri(), "request");
    next.run(request).await
}

async fn index_json(State(catalog): State<Arc<Catalog>>) -> Response {
    match catalog.index() {
        Ok(stream) => Json(stream).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to read images directory");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to open images dir").into_response()
        }
    }
}

async fn images_json(State(catalog): State<Arc<Catalog>>) -> Response {
    match catalog.products() {
        Ok(products) => Json(products).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to read images directory");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to open images dir").into_response()
        }
    }
}

async fn serve_bundle(
    State(catalog): State<Arc<Catalog>>,
    UrlPath(filename): UrlPath<String>,
) -> Response {
    let Some(path) = catalog.bundle_path(&filename) else {
        tracing::error!(filename = %filename, "unsupported rootfs path");
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::File::open(&path).await {
        Ok(file) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Body::from_stream(ReaderStream::new(file)),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to open bundle");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
