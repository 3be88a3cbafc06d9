//! File helpers for state that k8sd rewrites in place.
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// The user and group that files written by k8sd should belong to.
///
/// The daemon runs privileged but its files must stay readable by the
/// unprivileged user it acts for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
}

/// Replaces the contents of `path` with `contents`.
///
/// The data is written to a temporary file in the same directory which is
/// then renamed over `path`, so readers see either the old or the new file.
pub fn write_file<P: AsRef<Path>>(
    path: P,
    contents: &[u8],
    mode: u32,
    owner: Option<Owner>,
) -> anyhow::Result<()> {
    write_file_with(path, mode, owner, |file| Ok(file.write_all(contents)?))
}

/// Like [`write_file`], for contents streamed into the file by `write`.
///
/// If `write` fails, `path` is left as it was.
pub fn write_file_with<P, F>(path: P, mode: u32, owner: Option<Owner>, write: F) -> anyhow::Result<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut fs::File) -> anyhow::Result<()>,
{
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".k8sd-")
        .tempfile_in(dir)
        .with_context(|| format!("failed to create temporary file in {}", dir.display()))?;
    write(tmp.as_file_mut()).with_context(|| format!("failed to write {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync {}", path.display()))?;
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set permissions of {}", path.display()))?;
    if let Some(owner) = owner {
        std::os::unix::fs::chown(tmp.path(), Some(owner.uid), Some(owner.gid))
            .with_context(|| format!("failed to chown {}", path.display()))?;
    }
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Removes a directory tree, treating a missing directory as already removed.
pub fn remove_dir_all_if_exists<P: AsRef<Path>>(path: P) -> std::io::Result<bool> {
    match fs::remove_dir_all(path.as_ref()) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_file_replaces_content_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.yaml");
        fs::write(&path, "name: old\n").unwrap();

        write_file(&path, b"name: new\n", 0o644, None).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "name: new\n");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1, "temporary file left behind");
    }

    #[test]
    fn failed_write_keeps_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recovery_db.tar.gz");
        fs::write(&path, "previous").unwrap();

        let result = write_file_with(&path, 0o644, None, |file| {
            file.write_all(b"partial")?;
            anyhow::bail!("archive source vanished")
        });

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "previous");
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1, "temporary file left behind");
    }

    #[test]
    fn write_file_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("info.yaml");
        assert!(write_file(&path, b"id: 1\n", 0o644, None).is_err());
    }

    #[test]
    fn removing_missing_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("k8s-dqlite");
        fs::create_dir_all(target.join("nested")).unwrap();
        assert!(remove_dir_all_if_exists(&target).unwrap());
        assert!(!target.exists());
        assert!(!remove_dir_all_if_exists(&target).unwrap());
    }
}
