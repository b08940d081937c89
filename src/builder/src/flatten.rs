//! Layer flattening.
//!
//! Collapses an ordered stack of OCI layer tars into a single tar whose
//! entries live under `rootfs/`. Layers are walked in reverse (topmost
//! first), so every path is decided exactly once: the first layer to
//! mention a path wins, and whiteout markers from upper layers turn into
//! plain omissions instead of requiring any rewriting of earlier output.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use tar::{Builder, EntryType, Header};

use lxdocker_core::error::{LxdockerError, Result};

const WHITEOUT_PREFIX: &str = ".wh.";
const ROOTFS_PREFIX: &str = "rootfs";

/// One layer of an image, openable as an uncompressed tar stream.
///
/// The flattener only ever holds one open stream at a time; each reader
/// is dropped when its layer has been consumed.
pub trait LayerSource {
    fn open(&self) -> Result<Box<dyn Read>>;
}

/// Paths already decided while merging layers top-down.
///
/// A path maps to `true` when it is final: emitted as a non-directory or
/// recognized as a tombstone. It maps to `false` when emitted as a
/// directory, which entries from lower layers may still extend.
#[derive(Debug, Default)]
pub struct SeenPaths {
    map: HashMap<String, bool>,
    tombstones: HashSet<String>,
}

impl SeenPaths {
    pub fn new() -> Self {
        Self::default()
    }

    fn contains(&self, path: &str) -> bool {
        self.map.contains_key(path)
    }

    fn record(&mut self, path: &str, terminal: bool) {
        self.map.insert(path.to_string(), terminal);
    }

    fn record_tombstone(&mut self, path: &str) {
        self.map.insert(path.to_string(), true);
        self.tombstones.insert(path.to_string());
    }

    fn is_tombstoned(&self, path: &str) -> bool {
        self.tombstones.contains(path)
    }

    /// True when any proper ancestor of `path` is final (a directory
    /// tombstone, or a non-directory shadowing the whole subtree).
    fn under_terminal_ancestor(&self, path: &str) -> bool {
        let mut cur = path;
        while let Some(pos) = cur.rfind('/') {
            cur = &cur[..pos];
            if self.map.get(cur) == Some(&true) {
                return true;
            }
        }
        false
    }
}

/// Lexically normalize a tar entry name: drop `.` and empty components,
/// resolve `..`, strip leading and trailing slashes.
fn normalize(name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for comp in name.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    parts.join("/")
}

fn split_base(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

fn join(dir: &str, base: &str) -> String {
    if dir.is_empty() {
        base.to_string()
    } else {
        format!("{dir}/{base}")
    }
}

fn archive_err(context: &str, e: std::io::Error) -> LxdockerError {
    LxdockerError::ArchiveError(format!("{context}: {e}"))
}

/// Rebuild a source entry's header in the output's single format.
///
/// Layers arrive in whatever dialect their producer chose (USTAR, GNU,
/// PAX); the merged archive must not depend on that per-entry guess, and
/// the output format has no USTAR name-length limits.
fn uniform_header(source: &Header) -> std::io::Result<Header> {
    let mut header = Header::new_gnu();
    header.set_entry_type(source.entry_type());
    header.set_mode(source.mode()?);
    header.set_uid(source.uid()?);
    header.set_gid(source.gid()?);
    header.set_mtime(source.mtime()?);
    header.set_size(source.size()?);
    if let Some(major) = source.device_major()? {
        header.set_device_major(major)?;
    }
    if let Some(minor) = source.device_minor()? {
        header.set_device_minor(minor)?;
    }
    Ok(header)
}

/// Append a generated file under `rootfs/` and reserve its path so no
/// image layer can supply it.
pub fn append_synthesized<W: Write>(
    builder: &mut Builder<W>,
    seen: &mut SeenPaths,
    path: &str,
    mode: u32,
    data: &[u8],
) -> Result<()> {
    let logical = normalize(path);
    if seen.contains(&logical) {
        return Ok(());
    }
    seen.record(&logical, true);

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_size(data.len() as u64);
    builder
        .append_data(&mut header, format!("{ROOTFS_PREFIX}/{logical}"), data)
        .map_err(|e| archive_err(&logical, e))?;
    Ok(())
}

/// Append a file copied from the host under `rootfs/`, reserving its path.
pub fn append_host_file<W: Write>(
    builder: &mut Builder<W>,
    seen: &mut SeenPaths,
    path: &str,
    src: &Path,
    mode: u32,
) -> Result<()> {
    let logical = normalize(path);
    if seen.contains(&logical) {
        return Ok(());
    }
    let meta = std::fs::metadata(src).map_err(|e| LxdockerError::fs(src, e))?;
    let file = File::open(src).map_err(|e| LxdockerError::fs(src, e))?;
    seen.record(&logical, true);

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_size(meta.len());
    builder
        .append_data(&mut header, format!("{ROOTFS_PREFIX}/{logical}"), file)
        .map_err(|e| archive_err(&logical, e))?;
    Ok(())
}

/// Reserve a path without emitting anything under `rootfs/`.
pub fn reserve(seen: &mut SeenPaths, path: &str) {
    seen.record(&normalize(path), true);
}

/// Merge `layers` (base first) into `builder` under `rootfs/`.
pub fn flatten_layers<W: Write, L: LayerSource>(
    builder: &mut Builder<W>,
    seen: &mut SeenPaths,
    layers: &[L],
) -> Result<()> {
    for (index, layer) in layers.iter().enumerate().rev() {
        tracing::debug!(layer = index, "flattening layer");
        let reader = layer.open()?;
        let mut archive = tar::Archive::new(reader);
        let entries = archive
            .entries()
            .map_err(|e| archive_err("reading layer", e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| archive_err("reading layer entry", e))?;
            write_layer_entry(builder, seen, &mut entry)?;
        }
        // the layer reader drops here, so at most one decompression
        // stream is open at any point
    }
    Ok(())
}

fn write_layer_entry<W: Write, R: Read>(
    builder: &mut Builder<W>,
    seen: &mut SeenPaths,
    entry: &mut tar::Entry<'_, R>,
) -> Result<()> {
    let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
    let cleaned = normalize(&raw);
    let (dir, base) = split_base(&cleaned);

    let (tombstone, logical) = match base.strip_prefix(WHITEOUT_PREFIX) {
        Some(stripped) => (true, join(dir, stripped)),
        None => (false, cleaned.clone()),
    };

    // entries collapsing to the root are represented by the prefix itself
    if logical.is_empty() {
        return Ok(());
    }

    if seen.contains(&logical) {
        return Ok(());
    }
    if seen.under_terminal_ancestor(&logical) {
        return Ok(());
    }

    let entry_type = entry.header().entry_type();
    if tombstone {
        seen.record_tombstone(&logical);
        return Ok(());
    }
    seen.record(&logical, entry_type != EntryType::Directory);

    let dest = format!("{ROOTFS_PREFIX}/{logical}");
    let mut header = uniform_header(entry.header()).map_err(|e| archive_err(&logical, e))?;

    match entry_type {
        EntryType::Link => {
            let target = normalize(&String::from_utf8_lossy(
                entry.link_name_bytes().as_deref().unwrap_or_default(),
            ));
            // the link target was deleted by an upper layer; the path is
            // shadowed but there is nothing to point at
            if seen.is_tombstoned(&target) {
                return Ok(());
            }
            builder
                .append_link(&mut header, dest, format!("{ROOTFS_PREFIX}/{target}"))
                .map_err(|e| archive_err(&logical, e))?;
        }
        EntryType::Symlink => {
            let target = String::from_utf8_lossy(
                entry.link_name_bytes().as_deref().unwrap_or_default(),
            )
            .into_owned();
            builder
                .append_link(&mut header, dest, &target)
                .map_err(|e| archive_err(&logical, e))?;
        }
        _ => {
            builder
                .append_data(&mut header, dest, entry)
                .map_err(|e| archive_err(&logical, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// A layer held in memory as an uncompressed tar.
    struct MemLayer(Vec<u8>);

    impl MemLayer {
        fn build(entries: &[(&str, Option<&[u8]>)]) -> Self {
            let mut builder = Builder::new(Vec::new());
            for (name, content) in entries {
                match content {
                    Some(data) => {
                        let mut header = Header::new_gnu();
                        header.set_entry_type(EntryType::Regular);
                        header.set_mode(0o644);
                        header.set_uid(0);
                        header.set_gid(0);
                        header.set_size(data.len() as u64);
                        builder.append_data(&mut header, name, *data).unwrap();
                    }
                    None => {
                        let mut header = Header::new_gnu();
                        header.set_entry_type(EntryType::Directory);
                        header.set_mode(0o755);
                        header.set_uid(0);
                        header.set_gid(0);
                        header.set_size(0);
                        builder.append_data(&mut header, name, &[][..]).unwrap();
                    }
                }
            }
            MemLayer(builder.into_inner().unwrap())
        }
    }

    impl LayerSource for MemLayer {
        fn open(&self) -> Result<Box<dyn Read>> {
            Ok(Box::new(Cursor::new(self.0.clone())))
        }
    }

    fn flatten(layers: &[MemLayer]) -> Vec<(String, Vec<u8>)> {
        flatten_seeded(layers, &[])
    }

    fn flatten_seeded(layers: &[MemLayer], reserved: &[&str]) -> Vec<(String, Vec<u8>)> {
        let mut builder = Builder::new(Vec::new());
        let mut seen = SeenPaths::new();
        for path in reserved {
            reserve(&mut seen, path);
        }
        flatten_layers(&mut builder, &mut seen, layers).unwrap();
        let bytes = builder.into_inner().unwrap();

        let mut archive = tar::Archive::new(Cursor::new(bytes));
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let name = e.path().unwrap().to_string_lossy().into_owned();
                let mut data = Vec::new();
                e.read_to_end(&mut data).unwrap();
                (name, data)
            })
            .collect()
    }

    fn names(entries: &[(String, Vec<u8>)]) -> Vec<&str> {
        entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    #[test]
    fn test_single_layer_is_prefixed() {
        let layer = MemLayer::build(&[("etc", None), ("etc/hosts", Some(b"127.0.0.1"))]);
        let out = flatten(&[layer]);
        assert_eq!(names(&out), vec!["rootfs/etc", "rootfs/etc/hosts"]);
        assert_eq!(out[1].1, b"127.0.0.1");
    }

    #[test]
    fn test_upper_layer_wins() {
        let lower = MemLayer::build(&[("etc/conf", Some(b"old"))]);
        let upper = MemLayer::build(&[("etc/conf", Some(b"new"))]);
        let out = flatten(&[lower, upper]);
        assert_eq!(names(&out), vec!["rootfs/etc/conf"]);
        assert_eq!(out[0].1, b"new");
    }

    #[test]
    fn test_whiteout_removes_lower_file() {
        let lower = MemLayer::build(&[("etc/a", Some(b"a")), ("etc/b", Some(b"b"))]);
        let upper = MemLayer::build(&[("etc/.wh.a", Some(b""))]);
        let out = flatten(&[lower, upper]);
        assert_eq!(names(&out), vec!["rootfs/etc/b"]);
    }

    #[test]
    fn test_whiteout_on_directory_hides_subtree() {
        let lower = MemLayer::build(&[
            ("data", None),
            ("data/x", Some(b"x")),
            ("data/sub", None),
            ("data/sub/y", Some(b"y")),
        ]);
        let upper = MemLayer::build(&[(".wh.data", Some(b""))]);
        let out = flatten(&[lower, upper]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_recreated_after_whiteout() {
        // layer 0 creates, layer 1 deletes, layer 2 recreates
        let l0 = MemLayer::build(&[("etc/a", Some(b"old"))]);
        let l1 = MemLayer::build(&[("etc/.wh.a", Some(b""))]);
        let l2 = MemLayer::build(&[("etc/a", Some(b"new"))]);
        let out = flatten(&[l0, l1, l2]);
        assert_eq!(names(&out), vec!["rootfs/etc/a"]);
        assert_eq!(out[0].1, b"new");
    }

    #[test]
    fn test_file_shadows_lower_directory() {
        let lower = MemLayer::build(&[("opt", None), ("opt/tool", Some(b"bin"))]);
        let upper = MemLayer::build(&[("opt", Some(b"now a file"))]);
        let out = flatten(&[lower, upper]);
        assert_eq!(names(&out), vec!["rootfs/opt"]);
        assert_eq!(out[0].1, b"now a file");
    }

    #[test]
    fn test_duplicate_in_one_layer_first_wins() {
        let mut builder = Builder::new(Vec::new());
        for data in [&b"first"[..], &b"second"[..]] {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_mode(0o644);
            header.set_uid(0);
            header.set_gid(0);
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, "dup", data).unwrap();
        }
        let layer = MemLayer(builder.into_inner().unwrap());

        let out = flatten(&[layer]);
        assert_eq!(names(&out), vec!["rootfs/dup"]);
        assert_eq!(out[0].1, b"first");
    }

    #[test]
    fn test_dot_prefixed_names_normalize() {
        let lower = MemLayer::build(&[("./etc/a", Some(b"lower"))]);
        let upper = MemLayer::build(&[("etc/a", Some(b"upper"))]);
        let out = flatten(&[lower, upper]);
        assert_eq!(names(&out), vec!["rootfs/etc/a"]);
        assert_eq!(out[0].1, b"upper");
    }

    #[test]
    fn test_reserved_paths_exclude_layer_entries() {
        let layer = MemLayer::build(&[("sbin/init", Some(b"evil")), ("bin/sh", Some(b"sh"))]);
        let out = flatten_seeded(&[layer], &["sbin/init"]);
        assert_eq!(names(&out), vec!["rootfs/bin/sh"]);
    }

    #[test]
    fn test_symlink_target_verbatim() {
        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(0);
        builder
            .append_link(&mut header, "bin/sh", "/bin/busybox")
            .unwrap();
        let layer = MemLayer(builder.into_inner().unwrap());

        let mut out_builder = Builder::new(Vec::new());
        let mut seen = SeenPaths::new();
        flatten_layers(&mut out_builder, &mut seen, &[layer]).unwrap();
        let bytes = out_builder.into_inner().unwrap();

        let mut archive = tar::Archive::new(Cursor::new(bytes));
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_string_lossy(), "rootfs/bin/sh");
        assert_eq!(
            entry.link_name().unwrap().unwrap().to_string_lossy(),
            "/bin/busybox"
        );
    }

    #[test]
    fn test_hardlink_target_rewritten() {
        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(4);
        builder.append_data(&mut header, "bin/a", &b"data"[..]).unwrap();
        let mut link = Header::new_gnu();
        link.set_entry_type(EntryType::Link);
        link.set_mode(0o644);
        link.set_uid(0);
        link.set_gid(0);
        link.set_size(0);
        builder.append_link(&mut link, "bin/b", "bin/a").unwrap();
        let layer = MemLayer(builder.into_inner().unwrap());

        let mut out_builder = Builder::new(Vec::new());
        let mut seen = SeenPaths::new();
        flatten_layers(&mut out_builder, &mut seen, &[layer]).unwrap();
        let bytes = out_builder.into_inner().unwrap();

        let mut archive = tar::Archive::new(Cursor::new(bytes));
        let entries: Vec<_> = archive.entries().unwrap().map(|e| e.unwrap()).collect();
        let link_entry = entries
            .iter()
            .find(|e| e.path().unwrap().to_string_lossy() == "rootfs/bin/b")
            .unwrap();
        assert_eq!(
            link_entry.link_name().unwrap().unwrap().to_string_lossy(),
            "rootfs/bin/a"
        );
    }

    #[test]
    fn test_hardlink_to_tombstoned_target_dropped() {
        let lower = MemLayer::build(&[("bin/a", Some(b"data"))]);
        let mut builder = Builder::new(Vec::new());
        let mut link = Header::new_gnu();
        link.set_entry_type(EntryType::Link);
        link.set_mode(0o644);
        link.set_uid(0);
        link.set_gid(0);
        link.set_size(0);
        builder.append_link(&mut link, "bin/b", "bin/a").unwrap();
        let mid = MemLayer(builder.into_inner().unwrap());
        let upper = MemLayer::build(&[("bin/.wh.a", Some(b""))]);

        let out = flatten(&[lower, mid, upper]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_headers_rewritten_to_single_format() {
        // the source layer uses USTAR headers; the output must not
        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o640);
        header.set_uid(123);
        header.set_gid(456);
        header.set_mtime(1700000000);
        header.set_size(4);
        builder.append_data(&mut header, "etc/conf", &b"data"[..]).unwrap();
        let layer = MemLayer(builder.into_inner().unwrap());

        let mut out_builder = Builder::new(Vec::new());
        let mut seen = SeenPaths::new();
        flatten_layers(&mut out_builder, &mut seen, &[layer]).unwrap();
        let bytes = out_builder.into_inner().unwrap();

        let mut archive = tar::Archive::new(Cursor::new(bytes));
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        let header = entry.header();
        assert!(header.as_gnu().is_some());
        assert_eq!(header.mode().unwrap(), 0o640);
        assert_eq!(header.uid().unwrap(), 123);
        assert_eq!(header.gid().unwrap(), 456);
        assert_eq!(header.mtime().unwrap(), 1700000000);
        assert_eq!(header.entry_size().unwrap(), 4);
    }

    #[test]
    fn test_opaque_marker_is_consumed() {
        let lower = MemLayer::build(&[("data/kept", Some(b"kept"))]);
        let upper = MemLayer::build(&[("data/.wh..wh..opq", Some(b""))]);
        let out = flatten(&[lower, upper]);
        // the marker never appears; opaque semantics are not applied
        assert_eq!(names(&out), vec!["rootfs/data/kept"]);
    }
}
