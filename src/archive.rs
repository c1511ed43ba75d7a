//! Archive codec for deployment payloads.
//!
//! A payload is a flat, length-delimited stream of entries:
//!
//! ```text
//! entry := kind:u8 | path_len:u16 | path | mode:u32 | [size:u64 | content]
//! kind  := 0 = end of archive, 1 = directory, 2 = regular file
//! ```
//!
//! Paths are relative, '/'-separated, parents before children. A valid
//! deployment payload has exactly one top-level entry; that invariant is
//! checked by the consumer ([`Staging::sole_entry`]), not by `pack` — a
//! producer may legitimately pack anything.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use glob::Pattern;
use tempfile::TempDir;

use crate::error::{DeployError, Result};

const ENTRY_END: u8 = 0;
const ENTRY_DIR: u8 = 1;
const ENTRY_FILE: u8 = 2;

#[cfg(unix)]
fn entry_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn entry_mode(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o555
    } else {
        0o755
    }
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

fn is_ignored(path: &Path, ignore: &[Pattern]) -> bool {
    ignore.iter().any(|pattern| {
        pattern.matches_path(path)
            || path
                .file_name()
                .is_some_and(|name| pattern.matches_path(Path::new(name)))
    })
}

/// Pack a file or directory into an archive.
///
/// The root entry is named by the final path component, so unpacking yields
/// that single entry at the top level. Paths matching an ignore pattern are
/// skipped, as are non-regular special files.
pub fn pack(path: &Path, ignore: &[Pattern]) -> Result<Vec<u8>> {
    let root = fs::canonicalize(path)?;
    let base = root.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut buf = BytesMut::new();
    pack_entry(&root, &base, ignore, &mut buf)?;
    buf.put_u8(ENTRY_END);
    Ok(buf.to_vec())
}

fn pack_entry(path: &Path, base: &Path, ignore: &[Pattern], buf: &mut BytesMut) -> Result<()> {
    if is_ignored(path, ignore) {
        return Ok(());
    }

    let meta = fs::symlink_metadata(path)?;
    let rel = relative_name(path, base)?;
    let mode = entry_mode(&meta);

    if meta.is_dir() {
        put_header(buf, ENTRY_DIR, &rel, mode)?;
        let mut children: Vec<PathBuf> = fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<_>>()?;
        children.sort();
        for child in children {
            pack_entry(&child, base, ignore, buf)?;
        }
    } else if meta.is_file() {
        let content = fs::read(path)?;
        put_header(buf, ENTRY_FILE, &rel, mode)?;
        buf.put_u64(content.len() as u64);
        buf.put_slice(&content);
    }
    // Symlinks and special files are not deployable; skip them.

    Ok(())
}

fn relative_name(path: &Path, base: &Path) -> Result<String> {
    let rel = path.strip_prefix(base).map_err(|_| {
        DeployError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is outside the archive base", path.display()),
        ))
    })?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn put_header(buf: &mut BytesMut, kind: u8, path: &str, mode: u32) -> Result<()> {
    let path_bytes = path.as_bytes();
    if path_bytes.len() > u16::MAX as usize {
        return Err(DeployError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("entry path too long: {path}"),
        )));
    }
    buf.put_u8(kind);
    buf.put_u16(path_bytes.len() as u16);
    buf.put_slice(path_bytes);
    buf.put_u32(mode);
    Ok(())
}

/// An unpacked archive in a temporary staging directory.
///
/// The directory is deleted when the value is dropped, on every exit path.
#[derive(Debug)]
pub struct Staging {
    dir: TempDir,
}

impl Staging {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// The single top-level entry of a valid deployment payload.
    ///
    /// Archives with zero or multiple top-level entries are rejected here,
    /// before any activation can happen.
    pub fn sole_entry(&self) -> Result<PathBuf> {
        let mut entries: Vec<PathBuf> = fs::read_dir(self.dir.path())?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<_>>()?;
        if entries.len() != 1 {
            return Err(DeployError::CorruptArchive(format!(
                "expected exactly one top-level entry, found {}",
                entries.len()
            )));
        }
        Ok(entries.remove(0))
    }
}

/// Unpack an archive into a fresh staging directory.
///
/// Entry paths are validated before any write: absolute paths and `..`
/// components are rejected, so unpack can never touch anything outside the
/// staging root.
pub fn unpack(data: &[u8]) -> Result<Staging> {
    let dir = tempfile::Builder::new().prefix("dcontrol-").tempdir()?;

    let mut buf = data;
    loop {
        if buf.remaining() < 1 {
            return Err(DeployError::CorruptArchive(
                "missing end-of-archive marker".to_string(),
            ));
        }
        let kind = buf.get_u8();
        if kind == ENTRY_END {
            break;
        }
        if kind != ENTRY_DIR && kind != ENTRY_FILE {
            return Err(DeployError::CorruptArchive(format!(
                "unknown entry kind {kind}"
            )));
        }

        if buf.remaining() < 2 {
            return Err(DeployError::CorruptArchive(
                "truncated entry header".to_string(),
            ));
        }
        let path_len = buf.get_u16() as usize;
        if buf.remaining() < path_len + 4 {
            return Err(DeployError::CorruptArchive(
                "truncated entry header".to_string(),
            ));
        }
        let path = String::from_utf8(buf.copy_to_bytes(path_len).to_vec())
            .map_err(|_| DeployError::CorruptArchive("entry path is not UTF-8".to_string()))?;
        let mode = buf.get_u32();

        let full = staged_path(dir.path(), &path)?;
        if kind == ENTRY_DIR {
            fs::create_dir_all(&full)?;
            apply_mode(&full, mode)?;
        } else {
            if buf.remaining() < 8 {
                return Err(DeployError::CorruptArchive(format!(
                    "truncated file size for {path}"
                )));
            }
            let size = buf.get_u64() as usize;
            if buf.remaining() < size {
                return Err(DeployError::CorruptArchive(format!(
                    "truncated content for {path}: expected {size} bytes, got {}",
                    buf.remaining()
                )));
            }
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&full, buf.copy_to_bytes(size))?;
            apply_mode(&full, mode)?;
        }
    }

    Ok(Staging { dir })
}

/// Validate a relative archive path and resolve it under the staging root.
fn staged_path(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        return Err(DeployError::CorruptArchive(
            "empty entry path".to_string(),
        ));
    }
    let rel = Path::new(relative);
    if rel.is_absolute() {
        return Err(DeployError::CorruptArchive(format!(
            "absolute entry path not allowed: {relative}"
        )));
    }
    for component in rel.components() {
        match component {
            Component::ParentDir => {
                return Err(DeployError::CorruptArchive(format!(
                    "path traversal not allowed: {relative}"
                )))
            }
            Component::Prefix(_) => {
                return Err(DeployError::CorruptArchive(format!(
                    "prefixed entry path not allowed: {relative}"
                )))
            }
            _ => {}
        }
    }
    Ok(root.join(rel))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn directory_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("app");
        write_file(&src.join("bin/run.sh"), "#!/bin/sh\n");
        write_file(&src.join("conf/app.toml"), "port = 80\n");
        write_file(&src.join("README"), "readme\n");

        let data = pack(&src, &[]).unwrap();
        let staging = unpack(&data).unwrap();
        let entry = staging.sole_entry().unwrap();

        assert_eq!(entry.file_name().unwrap(), "app");
        assert_eq!(
            fs::read_to_string(entry.join("bin/run.sh")).unwrap(),
            "#!/bin/sh\n"
        );
        assert_eq!(
            fs::read_to_string(entry.join("conf/app.toml")).unwrap(),
            "port = 80\n"
        );
        assert_eq!(fs::read_to_string(entry.join("README")).unwrap(), "readme\n");
    }

    #[test]
    fn single_file_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("app.bin");
        write_file(&src, "binary payload");

        let data = pack(&src, &[]).unwrap();
        let staging = unpack(&data).unwrap();
        let entry = staging.sole_entry().unwrap();

        assert_eq!(entry.file_name().unwrap(), "app.bin");
        assert_eq!(fs::read_to_string(&entry).unwrap(), "binary payload");
    }

    #[cfg(unix)]
    #[test]
    fn modes_preserved() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("app");
        write_file(&src.join("run.sh"), "#!/bin/sh\n");
        fs::set_permissions(src.join("run.sh"), fs::Permissions::from_mode(0o755)).unwrap();

        let data = pack(&src, &[]).unwrap();
        let staging = unpack(&data).unwrap();
        let entry = staging.sole_entry().unwrap();

        let mode = fs::metadata(entry.join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn ignored_entries_absent() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("app");
        write_file(&src.join("keep.txt"), "keep");
        write_file(&src.join("debug.log"), "drop");

        let ignore = [Pattern::new("*.log").unwrap()];
        let data = pack(&src, &ignore).unwrap();
        let staging = unpack(&data).unwrap();
        let entry = staging.sole_entry().unwrap();

        assert!(entry.join("keep.txt").exists());
        assert!(!entry.join("debug.log").exists());
    }

    #[test]
    fn multi_entry_archive_rejected_by_consumer() {
        // Hand-built archive with two top-level entries. pack() never
        // produces this, but a hostile client can.
        let mut buf = BytesMut::new();
        put_header(&mut buf, ENTRY_FILE, "one", 0o644).unwrap();
        buf.put_u64(1);
        buf.put_slice(b"a");
        put_header(&mut buf, ENTRY_FILE, "two", 0o644).unwrap();
        buf.put_u64(1);
        buf.put_slice(b"b");
        buf.put_u8(ENTRY_END);

        let staging = unpack(&buf).unwrap();
        match staging.sole_entry() {
            Err(DeployError::CorruptArchive(msg)) => assert!(msg.contains("found 2")),
            other => panic!("expected CorruptArchive, got {other:?}"),
        }
    }

    #[test]
    fn empty_archive_rejected_by_consumer() {
        let mut buf = BytesMut::new();
        buf.put_u8(ENTRY_END);
        let staging = unpack(&buf).unwrap();
        assert!(matches!(
            staging.sole_entry(),
            Err(DeployError::CorruptArchive(_))
        ));
    }

    #[test]
    fn traversal_rejected() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, ENTRY_FILE, "../escape", 0o644).unwrap();
        buf.put_u64(1);
        buf.put_slice(b"x");
        buf.put_u8(ENTRY_END);

        assert!(matches!(
            unpack(&buf),
            Err(DeployError::CorruptArchive(_))
        ));
    }

    #[test]
    fn absolute_path_rejected() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, ENTRY_FILE, "/etc/passwd", 0o644).unwrap();
        buf.put_u64(1);
        buf.put_slice(b"x");
        buf.put_u8(ENTRY_END);

        assert!(matches!(
            unpack(&buf),
            Err(DeployError::CorruptArchive(_))
        ));
    }

    #[test]
    fn truncated_archive_rejected() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, ENTRY_FILE, "file", 0o644).unwrap();
        buf.put_u64(100);
        buf.put_slice(b"short");
        // No end marker, content shorter than declared.

        assert!(matches!(
            unpack(&buf),
            Err(DeployError::CorruptArchive(_))
        ));
    }

    #[test]
    fn missing_end_marker_rejected() {
        let mut buf = BytesMut::new();
        put_header(&mut buf, ENTRY_DIR, "dir", 0o755).unwrap();

        assert!(matches!(
            unpack(&buf),
            Err(DeployError::CorruptArchive(_))
        ));
    }
}
