//! Filesystem tree indexing, diffing, and copying.
//!
//! A layer is the diff produced by exactly one step. The pipeline indexes
//! the staging rootfs before and after a step; paths whose content or mode
//! changed become the layer payload, paths that disappeared are recorded as
//! removals.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// Content stamp for one path: enough to detect any change a step made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStamp {
    pub kind: EntryKind,
    pub mode: u32,
    /// sha256 of file contents, or of the link target for symlinks.
    /// Empty for directories.
    pub digest: String,
}

/// Sorted index of a tree: path relative to the root → stamp.
#[derive(Debug, Clone, Default)]
pub struct TreeIndex {
    entries: BTreeMap<PathBuf, FileStamp>,
}

impl TreeIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&FileStamp> {
        self.entries.get(path)
    }

    /// Entries in sorted path order.
    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &FileStamp)> {
        self.entries.iter()
    }
}

/// What one step changed: paths to carry in the layer blob, and paths the
/// step deleted.
#[derive(Debug, Clone, Default)]
pub struct TreeDiff {
    pub changed: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Index every entry under `root` (root itself excluded).
pub fn index_tree(root: &Path) -> Result<TreeIndex> {
    let mut entries = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry =
            entry.with_context(|| format!("walking tree under '{}'", root.display()))?;
        if entry.path() == root {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?
            .to_path_buf();
        let stamp = stamp_path(entry.path())?;
        entries.insert(rel, stamp);
    }
    Ok(TreeIndex { entries })
}

/// Diff two indexes of the same root taken before and after a step.
///
/// `changed` holds added and modified paths in sorted order; `removed`
/// holds paths present before but not after.
pub fn diff_trees(before: &TreeIndex, after: &TreeIndex) -> TreeDiff {
    let mut diff = TreeDiff::default();
    for (path, stamp) in &after.entries {
        match before.entries.get(path) {
            Some(previous) if previous == stamp => {}
            _ => diff.changed.push(path.clone()),
        }
    }
    for path in before.entries.keys() {
        if !after.entries.contains_key(path) {
            diff.removed.push(path.clone());
        }
    }
    diff
}

/// Recursively copy `source` into `dest`, preserving permissions and
/// recreating symlinks. Existing files at the destination are overwritten.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    if !source.is_dir() {
        bail!("copy source '{}' is not a directory", source.display());
    }
    fs::create_dir_all(dest)
        .with_context(|| format!("creating copy destination '{}'", dest.display()))?;

    for entry in WalkDir::new(source).follow_links(false) {
        let entry =
            entry.with_context(|| format!("walking copy source '{}'", source.display()))?;
        if entry.path() == source {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?;
        let target = dest.join(rel);
        copy_entry(entry.path(), &target)?;
    }
    Ok(())
}

/// Copy the listed paths (relative to `root`) into `dest`, keeping the
/// directory structure. Used to assemble a layer blob from a diff.
pub fn export_paths(root: &Path, paths: &[PathBuf], dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("creating export destination '{}'", dest.display()))?;
    for rel in paths {
        let source = root.join(rel);
        let target = dest.join(rel);
        copy_entry(&source, &target)?;
    }
    Ok(())
}

fn copy_entry(source: &Path, target: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(source)
        .with_context(|| format!("reading metadata for '{}'", source.display()))?;
    let file_type = metadata.file_type();

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating parent directory '{}'", parent.display()))?;
    }

    if file_type.is_dir() {
        fs::create_dir_all(target)
            .with_context(|| format!("creating directory '{}'", target.display()))?;
        fs::set_permissions(target, metadata.permissions())
            .with_context(|| format!("setting permissions on '{}'", target.display()))?;
        return Ok(());
    }

    if file_type.is_symlink() {
        let link_target = fs::read_link(source)
            .with_context(|| format!("reading link target for '{}'", source.display()))?;
        if fs::symlink_metadata(target).is_ok() {
            fs::remove_file(target)
                .with_context(|| format!("removing existing '{}'", target.display()))?;
        }
        symlink(&link_target, target).with_context(|| {
            format!(
                "creating symlink '{}' -> '{}'",
                target.display(),
                link_target.display()
            )
        })?;
        return Ok(());
    }

    if file_type.is_file() {
        // fs::copy carries permission bits along with the contents.
        fs::copy(source, target).with_context(|| {
            format!("copying '{}' to '{}'", source.display(), target.display())
        })?;
        return Ok(());
    }

    bail!("unsupported file type at '{}'", source.display())
}

fn stamp_path(path: &Path) -> Result<FileStamp> {
    let metadata = fs::symlink_metadata(path)
        .with_context(|| format!("reading metadata for '{}'", path.display()))?;
    let mode = metadata.permissions().mode();
    let file_type = metadata.file_type();

    if file_type.is_dir() {
        return Ok(FileStamp {
            kind: EntryKind::Dir,
            mode,
            digest: String::new(),
        });
    }
    if file_type.is_symlink() {
        let target = fs::read_link(path)
            .with_context(|| format!("reading link target for '{}'", path.display()))?;
        let mut hasher = Sha256::new();
        hasher.update(target.as_os_str().as_encoded_bytes());
        return Ok(FileStamp {
            kind: EntryKind::Symlink,
            mode,
            digest: format!("{:x}", hasher.finalize()),
        });
    }
    if file_type.is_file() {
        let (digest, _size) = sha256_file(path)?;
        return Ok(FileStamp {
            kind: EntryKind::File,
            mode,
            digest,
        });
    }
    bail!("unsupported file type at '{}'", path.display())
}

/// Stream a file through sha256, returning the hex digest and byte count.
pub(crate) fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn index_and_diff_detect_changes() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("rootfs");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/keep"), "same").unwrap();
        fs::write(root.join("etc/gone"), "old").unwrap();

        let before = index_tree(&root).unwrap();

        fs::remove_file(root.join("etc/gone")).unwrap();
        fs::write(root.join("etc/new"), "fresh").unwrap();
        fs::write(root.join("etc/keep"), "changed").unwrap();

        let after = index_tree(&root).unwrap();
        let diff = diff_trees(&before, &after);

        assert_eq!(
            diff.changed,
            vec![PathBuf::from("etc/keep"), PathBuf::from("etc/new")]
        );
        assert_eq!(diff.removed, vec![PathBuf::from("etc/gone")]);
    }

    #[test]
    fn diff_of_identical_trees_is_empty() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("rootfs");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("file"), "contents").unwrap();

        let before = index_tree(&root).unwrap();
        let after = index_tree(&root).unwrap();
        assert!(diff_trees(&before, &after).is_empty());
    }

    #[test]
    fn diff_detects_mode_change() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("rootfs");
        fs::create_dir_all(&root).unwrap();
        let script = root.join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();

        let before = index_tree(&root).unwrap();

        let mut perms = fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).unwrap();

        let after = index_tree(&root).unwrap();
        let diff = diff_trees(&before, &after);
        assert_eq!(diff.changed, vec![PathBuf::from("run.sh")]);
    }

    #[test]
    fn copy_tree_preserves_contents_and_permissions() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("src");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("sub/app.rs"), "fn main() {}").unwrap();
        let script = source.join("build.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        let mut perms = fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).unwrap();
        symlink("sub/app.rs", source.join("link")).unwrap();

        let dest = temp.path().join("dst");
        copy_tree(&source, &dest).unwrap();

        assert_eq!(
            fs::read_to_string(dest.join("sub/app.rs")).unwrap(),
            "fn main() {}"
        );
        let mode = fs::metadata(dest.join("build.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(
            fs::read_link(dest.join("link")).unwrap(),
            PathBuf::from("sub/app.rs")
        );
    }

    #[test]
    fn copy_tree_rejects_missing_source() {
        let temp = TempDir::new().unwrap();
        let result = copy_tree(&temp.path().join("missing"), &temp.path().join("dst"));
        assert!(result.is_err());
    }

    #[test]
    fn export_paths_keeps_structure() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("rootfs");
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("usr/bin/tool"), "bin").unwrap();
        fs::write(root.join("ignored"), "no").unwrap();

        let dest = temp.path().join("diff");
        export_paths(&root, &[PathBuf::from("usr/bin/tool")], &dest).unwrap();

        assert_eq!(fs::read_to_string(dest.join("usr/bin/tool")).unwrap(), "bin");
        assert!(!dest.join("ignored").exists());
    }
}
