// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Path helpers shared by the container setup code.
//!
//! Everything here operates on paths that may not exist yet (the container
//! root is assembled from scratch), so none of the functions rely on
//! `canonicalize` or any other resolver that requires a live path.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{symlink, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::{chown, fchownat, mkdir, FchownatFlags, Gid, Uid};
use walkdir::WalkDir;

/// Removes consecutive and trailing directory separators.
///
/// A pure string operation: the path does not have to exist. The result is
/// `/` for `/`, and never ends in a separator otherwise.
pub fn clean(path: impl AsRef<Path>) -> PathBuf {
    let bytes = path.as_ref().as_os_str().as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    for &b in bytes {
        if b == b'/' && out.last() == Some(&b'/') {
            continue;
        }
        out.push(b);
    }
    if out.len() > 1 && out.last() == Some(&b'/') {
        out.pop();
    }
    PathBuf::from(OsString::from_vec(out))
}

/// Creates a directory and all of its parents with mode 0755.
///
/// An already existing entry is not an error, even when it is not a
/// directory. The container root may already provide the final component as
/// a regular file or a device node, and a later bind mount covers it.
pub fn create_all(path: impl AsRef<Path>) -> Result<()> {
    let mode = Mode::from_bits_truncate(0o755);
    let mut prefix = PathBuf::new();
    for component in path.as_ref().components() {
        prefix.push(component);
        match mkdir(&prefix, mode) {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(err) => {
                return Err(err).with_context(|| format!("mkdir {} mode=0755", prefix.display()))
            }
        }
    }
    Ok(())
}

fn sync_file(src: &Path, dst: &Path) -> Result<()> {
    let mut reader = File::open(src).with_context(|| format!("open {}", src.display()))?;
    let mut writer = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(dst)
        .with_context(|| format!("open {}", dst.display()))?;
    std::io::copy(&mut reader, &mut writer).with_context(|| format!("copy {}", dst.display()))?;
    Ok(())
}

fn sync_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = std::fs::read_link(src).with_context(|| format!("readlink {}", src.display()))?;
    symlink(&target, dst)
        .with_context(|| format!("symlink {} {}", target.display(), dst.display()))?;
    Ok(())
}

/// Recursively copies the tree under `source` into `target`, which must
/// already exist.
///
/// Regular files, directories and symbolic links are replicated with their
/// mode and ownership; symlink targets are recreated byte for byte and never
/// followed. Device nodes, sockets and FIFOs are skipped. Ownership is
/// mirrored on a best-effort basis so the copy also works without root.
pub fn sync(source: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<()> {
    let source = source.as_ref();
    let target = target.as_ref();

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.with_context(|| format!("walk {}", source.display()))?;
        let rel = match entry.path().strip_prefix(source) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let dst = target.join(rel);
        let meta = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            sync_symlink(entry.path(), &dst)?;
            let _ = fchownat(
                None,
                &dst,
                Some(Uid::from_raw(meta.uid())),
                Some(Gid::from_raw(meta.gid())),
                FchownatFlags::NoFollowSymlink,
            );
            continue;
        }

        if file_type.is_dir() {
            mkdir(&dst, Mode::from_bits_truncate(meta.mode()))
                .with_context(|| format!("mkdir {} mode={:#o}", dst.display(), meta.mode()))?;
        } else if file_type.is_file() {
            sync_file(entry.path(), &dst)?;
        } else {
            continue;
        }

        let _ = chown(&dst, Some(Uid::from_raw(meta.uid())), Some(Gid::from_raw(meta.gid())));
        std::fs::set_permissions(&dst, PermissionsExt::from_mode(meta.mode()))
            .with_context(|| format!("chmod {} mode={:#o}", dst.display(), meta.mode()))?;
    }
    Ok(())
}

/// Writes `contents` into an already existing file with a single write.
///
/// Used for kernel control files such as the cgroup `tasks` files, which
/// must never be created by us.
pub fn write_existing(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
    let path = path.as_ref();
    let mut file = OpenOptions::new()
        .write(true)
        .custom_flags(nix::libc::O_CLOEXEC)
        .open(path)
        .with_context(|| format!("failed to write file {}", path.display()))?;
    file.write_all(contents.as_ref())
        .with_context(|| format!("failed to write file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    #[test]
    fn clean_collapses_separators() {
        assert_eq!(clean("/var//boxer///abc"), PathBuf::from("/var/boxer/abc"));
        assert_eq!(clean("a//b"), PathBuf::from("a/b"));
    }

    #[test]
    fn clean_strips_trailing_separator() {
        assert_eq!(clean("/var/boxer/abc/"), PathBuf::from("/var/boxer/abc"));
        assert_eq!(clean("/var/boxer/abc//"), PathBuf::from("/var/boxer/abc"));
    }

    #[test]
    fn clean_preserves_root() {
        assert_eq!(clean("/"), PathBuf::from("/"));
        assert_eq!(clean("///"), PathBuf::from("/"));
    }

    #[test]
    fn clean_is_idempotent() {
        for input in ["/", "//a//b/", "a/b/c//", "/a"] {
            let once = clean(input);
            assert_eq!(clean(&once), once, "input = {input:?}");
        }
    }

    #[test]
    fn clean_never_introduces_double_separators() {
        let cleaned = clean("/a////b//c");
        assert!(!cleaned.as_os_str().as_bytes().windows(2).any(|w| w == b"//"));
    }

    #[test]
    fn create_all_creates_nested_directories() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a/b/c");
        create_all(&path)?;
        assert!(path.is_dir());
        Ok(())
    }

    #[test]
    fn create_all_tolerates_existing_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a/b");
        create_all(&path)?;
        create_all(&path)?;
        // An existing regular file at the final component is fine too.
        let file = dir.path().join("a/file");
        File::create(&file)?;
        create_all(&file)?;
        assert!(file.is_file());
        Ok(())
    }

    #[test]
    fn sync_replicates_tree() -> Result<()> {
        let src = tempfile::tempdir()?;
        let dst = tempfile::tempdir()?;

        fs::create_dir(src.path().join("sub"))?;
        fs::write(src.path().join("sub/data"), b"payload")?;
        fs::set_permissions(
            src.path().join("sub/data"),
            PermissionsExt::from_mode(0o640),
        )?;
        symlink("sub/data", src.path().join("link"))?;

        sync(src.path(), dst.path())?;

        assert!(dst.path().join("sub").is_dir());
        assert_eq!(fs::read(dst.path().join("sub/data"))?, b"payload");
        assert_eq!(
            fs::metadata(dst.path().join("sub/data"))?.mode() & 0o7777,
            0o640
        );
        assert_eq!(
            fs::read_link(dst.path().join("link"))?,
            PathBuf::from("sub/data")
        );
        Ok(())
    }

    #[test]
    fn sync_preserves_directory_mode() -> Result<()> {
        let src = tempfile::tempdir()?;
        let dst = tempfile::tempdir()?;

        fs::create_dir(src.path().join("locked"))?;
        fs::set_permissions(src.path().join("locked"), PermissionsExt::from_mode(0o700))?;

        sync(src.path(), dst.path())?;

        assert_eq!(
            fs::metadata(dst.path().join("locked"))?.mode() & 0o7777,
            0o700
        );
        Ok(())
    }

    #[test]
    fn write_existing_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(write_existing(dir.path().join("absent"), "1\n").is_err());
    }

    #[test]
    fn write_existing_overwrites_head() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("file");
        fs::write(&path, "old contents")?;
        write_existing(&path, "new\n")?;
        assert!(fs::read_to_string(&path)?.starts_with("new\n"));
        Ok(())
    }
}
