//! On-disk image store (content-addressed).
//!
//! Goals:
//! - Keep base images and layer diffs in a single place
//! - Address blobs by sha256 (`blobs/sha256/<prefix>/<digest>`)
//! - Keep a small JSON manifest per layer and per base image so snapshots
//!   can be materialized without any external tooling
//!
//! Layers are immutable once written: a build only ever appends new blobs
//! and manifests. A failed build leaves the chain truncated at the last
//! completed layer, which needs no cleanup.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

use crate::snapshot::{is_hex_64, LayerId, Snapshot};
use crate::step::BaseImage;
use crate::tree::sha256_file;

/// Default store directory name under the user cache directory.
pub const DEFAULT_STORE_DIR: &str = "image-builder";

/// Manifest for a registered base image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseImageManifest {
    pub name: String,
    pub tag: String,
    pub rootfs_sha256: String,
    pub size_bytes: u64,
    pub stored_at_unix: u64,
}

/// Manifest for one stored layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerManifest {
    pub id: LayerId,
    pub parent: Option<LayerId>,
    pub base: BaseImage,
    pub step_name: String,
    pub step_fingerprint: String,
    pub blob_sha256: String,
    /// Paths the step deleted, applied after the blob is extracted.
    pub removed: Vec<PathBuf>,
    pub size_bytes: u64,
    pub stored_at_unix: u64,
}

/// Image store rooted at a directory (default: `~/.cache/image-builder`).
#[derive(Debug, Clone)]
pub struct LayerStore {
    root: PathBuf,
}

impl LayerStore {
    /// Open (and create if needed) the store at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let store = Self {
            root: root.to_path_buf(),
        };
        store.ensure_layout()?;
        Ok(store)
    }

    /// Open the store at the default per-user location.
    pub fn open_default() -> Result<Self> {
        Self::open(&default_root()?)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding run manifests for this store.
    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(self.blobs_dir().join("sha256"))?;
        fs::create_dir_all(self.bases_dir())?;
        fs::create_dir_all(self.layers_dir())?;
        fs::create_dir_all(self.runs_dir())?;
        fs::create_dir_all(self.tmp_dir())?;
        fs::create_dir_all(self.locks_dir())?;
        Ok(())
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn bases_dir(&self) -> PathBuf {
        self.root.join("bases")
    }

    fn layers_dir(&self) -> PathBuf {
        self.root.join("layers")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn blob_path(&self, sha256: &str) -> Result<PathBuf> {
        if !is_hex_64(sha256) {
            bail!("invalid sha256: {sha256}");
        }
        let prefix = &sha256[0..2];
        Ok(self.blobs_dir().join("sha256").join(prefix).join(sha256))
    }

    fn base_manifest_path(&self, base: &BaseImage) -> PathBuf {
        self.bases_dir()
            .join(format!("{}@{}.json", base.name, base.tag))
    }

    fn layer_manifest_path(&self, id: &LayerId) -> PathBuf {
        self.layers_dir().join(format!("{}.json", id))
    }

    /// Scratch directory inside the store, unique per call.
    pub fn scratch_dir(&self, prefix: &str) -> Result<PathBuf> {
        let dir = self.tmp_dir().join(tmp_name(prefix));
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating scratch directory '{}'", dir.display()))?;
        Ok(dir)
    }

    /// Register a base image from a rootfs directory on the host.
    ///
    /// The rootfs is archived as a deterministic `tar.zst` blob and indexed
    /// by `name:tag`. Re-registering an existing reference overwrites the
    /// manifest but reuses the blob when the contents are identical.
    pub fn add_base_image(&self, base: &BaseImage, rootfs_dir: &Path) -> Result<String> {
        if !rootfs_dir.is_dir() {
            bail!("base rootfs '{}' is not a directory", rootfs_dir.display());
        }

        let tmp_tar = self.tmp_dir().join(tmp_name("base.tar.zst"));
        create_tar_zst(rootfs_dir, &tmp_tar)?;
        let (sha256, size_bytes) = sha256_file(&tmp_tar)?;
        self.adopt_blob(tmp_tar, &sha256)?;

        let manifest = BaseImageManifest {
            name: base.name.clone(),
            tag: base.tag.clone(),
            rootfs_sha256: sha256.clone(),
            size_bytes,
            stored_at_unix: now_unix(),
        };
        write_json_atomic(&self.base_manifest_path(base), &manifest, &self.tmp_dir())?;
        Ok(sha256)
    }

    /// Resolve a base image reference to its manifest.
    pub fn resolve_base(&self, base: &BaseImage) -> Result<BaseImageManifest> {
        let path = self.base_manifest_path(base);
        if !path.is_file() {
            bail!(
                "base image '{}' not found in store '{}' (register it with 'base add')",
                base.reference(),
                self.root.display()
            );
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("reading base manifest '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing base manifest '{}'", path.display()))
    }

    /// Unpack a base image rootfs into `dest_dir` (created fresh).
    pub fn materialize_base(&self, base: &BaseImage, dest_dir: &Path) -> Result<()> {
        let manifest = self.resolve_base(base)?;
        let blob = self.verified_blob(&manifest.rootfs_sha256, &base.reference())?;
        if dest_dir.exists() {
            bail!(
                "materialize destination '{}' already exists",
                dest_dir.display()
            );
        }
        fs::create_dir_all(dest_dir)
            .with_context(|| format!("creating '{}'", dest_dir.display()))?;
        extract_tar_zst(&blob, dest_dir)
    }

    /// Store the diff directory for one step as a new immutable layer.
    pub fn put_layer(
        &self,
        id: &LayerId,
        parent: Option<&LayerId>,
        base: &BaseImage,
        step_name: &str,
        step_fingerprint: &str,
        diff_dir: &Path,
        removed: &[PathBuf],
    ) -> Result<LayerManifest> {
        let manifest_path = self.layer_manifest_path(id);
        if manifest_path.exists() {
            bail!("layer {} already exists; layers are immutable", id.short());
        }

        let tmp_tar = self.tmp_dir().join(tmp_name("layer.tar.zst"));
        create_tar_zst(diff_dir, &tmp_tar)?;
        let (sha256, size_bytes) = sha256_file(&tmp_tar)?;
        self.adopt_blob(tmp_tar, &sha256)?;

        let manifest = LayerManifest {
            id: id.clone(),
            parent: parent.cloned(),
            base: base.clone(),
            step_name: step_name.to_string(),
            step_fingerprint: step_fingerprint.to_string(),
            blob_sha256: sha256,
            removed: removed.to_vec(),
            size_bytes,
            stored_at_unix: now_unix(),
        };
        write_json_atomic(&manifest_path, &manifest, &self.tmp_dir())?;
        Ok(manifest)
    }

    /// Load a layer manifest by id.
    pub fn layer_manifest(&self, id: &LayerId) -> Result<LayerManifest> {
        let path = self.layer_manifest_path(id);
        let bytes = fs::read(&path)
            .with_context(|| format!("reading layer manifest '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing layer manifest '{}'", path.display()))
    }

    /// Apply one layer on top of an already materialized tree: extract the
    /// diff blob over it, then delete the recorded removals.
    pub fn apply_layer(&self, id: &LayerId, dest_dir: &Path) -> Result<()> {
        let manifest = self.layer_manifest(id)?;
        let blob = self.verified_blob(&manifest.blob_sha256, &format!("layer {}", id.short()))?;
        extract_tar_zst(&blob, dest_dir)?;
        for rel in &manifest.removed {
            let target = dest_dir.join(rel);
            match fs::symlink_metadata(&target) {
                Ok(meta) if meta.is_dir() => {
                    fs::remove_dir_all(&target)
                        .with_context(|| format!("removing '{}'", target.display()))?;
                }
                Ok(_) => {
                    fs::remove_file(&target)
                        .with_context(|| format!("removing '{}'", target.display()))?;
                }
                // Already absent (e.g. parent directory removed first).
                Err(_) => {}
            }
        }
        Ok(())
    }

    /// Materialize a full snapshot: base rootfs, then every layer in order.
    pub fn materialize_snapshot(&self, snapshot: &Snapshot, dest_dir: &Path) -> Result<()> {
        self.materialize_base(snapshot.base(), dest_dir)?;
        for layer in snapshot.layers() {
            self.apply_layer(&layer.id, dest_dir)
                .with_context(|| format!("applying layer for step '{}'", layer.step_name))?;
        }
        Ok(())
    }

    /// Take the exclusive build lock for an image reference. The snapshot
    /// is exclusively owned by one pipeline for the duration of a build.
    pub fn lock_build(&self, image_ref: &str) -> Result<BuildLock> {
        let name: String = image_ref
            .chars()
            .map(|c| if c == '/' || c == ':' { '_' } else { c })
            .collect();
        let lock_path = self.locks_dir().join(format!("{}.lock", name));

        // Do not unlink "stale" lock files: unlinking a still-locked file
        // would let a second process lock a fresh file at the same path.
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("creating lock file '{}'", lock_path.display()))?;

        if lock_file.try_lock_exclusive().is_err() {
            drop(lock_file);
            bail!(
                "image '{}' is being built by another process (lock '{}')",
                image_ref,
                lock_path.display()
            );
        }

        Ok(BuildLock {
            _file: lock_file,
            path: lock_path,
        })
    }

    /// Best-effort garbage collection: remove blobs referenced by no base
    /// or layer manifest. Returns the number of blobs removed.
    pub fn gc(&self) -> Result<usize> {
        let mut referenced = std::collections::BTreeSet::new();
        for manifest in self.list_base_manifests()? {
            referenced.insert(manifest.rootfs_sha256);
        }
        for manifest in self.list_layer_manifests()? {
            referenced.insert(manifest.blob_sha256);
        }

        let blobs_root = self.blobs_dir().join("sha256");
        if !blobs_root.exists() {
            return Ok(0);
        }

        let mut removed = 0usize;
        for entry in WalkDir::new(&blobs_root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_hex_64(&name) || referenced.contains(&name) {
                continue;
            }
            fs::remove_file(entry.path()).with_context(|| {
                format!("removing unreferenced blob '{}'", entry.path().display())
            })?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn list_base_manifests(&self) -> Result<Vec<BaseImageManifest>> {
        let mut out = Vec::new();
        for path in json_files(&self.bases_dir())? {
            let bytes = fs::read(&path)?;
            let manifest: BaseImageManifest = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing base manifest '{}'", path.display()))?;
            out.push(manifest);
        }
        out.sort_by(|a, b| (&a.name, &a.tag).cmp(&(&b.name, &b.tag)));
        Ok(out)
    }

    pub fn list_layer_manifests(&self) -> Result<Vec<LayerManifest>> {
        let mut out = Vec::new();
        for path in json_files(&self.layers_dir())? {
            let bytes = fs::read(&path)?;
            let manifest: LayerManifest = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing layer manifest '{}'", path.display()))?;
            out.push(manifest);
        }
        out.sort_by_key(|m| m.stored_at_unix);
        Ok(out)
    }

    /// Move a tmp file into the blob directory (no-op if the blob exists).
    fn adopt_blob(&self, tmp_file: PathBuf, sha256: &str) -> Result<()> {
        let blob_path = self.blob_path(sha256)?;
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if blob_path.exists() {
            let _ = fs::remove_file(&tmp_file);
        } else {
            atomic_rename(&tmp_file, &blob_path)?;
        }
        Ok(())
    }

    /// Look up a blob and verify its hash on read (corruption detection).
    fn verified_blob(&self, sha256: &str, what: &str) -> Result<PathBuf> {
        let blob = self.blob_path(sha256)?;
        if !blob.exists() {
            bail!("blob missing for {} (expected '{}')", what, blob.display());
        }
        let (actual, _size) = sha256_file(&blob)?;
        if actual != sha256 {
            bail!(
                "blob hash mismatch for {}\n  expected: {}\n  actual:   {}",
                what,
                sha256,
                actual
            );
        }
        Ok(blob)
    }
}

/// RAII guard: unlocks and removes the lock file on drop.
#[derive(Debug)]
pub struct BuildLock {
    _file: File,
    path: PathBuf,
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Default store root: `<user cache dir>/image-builder`.
pub fn default_root() -> Result<PathBuf> {
    let cache = dirs::cache_dir().context("could not determine user cache directory")?;
    Ok(cache.join(DEFAULT_STORE_DIR))
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir).with_context(|| format!("reading '{}'", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{}-{n}", std::process::id())
}

fn atomic_rename(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Fall back to copy+remove (e.g. EXDEV).
            fs::copy(src, dst)
                .with_context(|| format!("copying '{}' to '{}'", src.display(), dst.display()))?;
            fs::remove_file(src)
                .with_context(|| format!("removing tmp '{}'", src.display()))?;
            Ok(())
        }
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T, tmp_dir: &Path) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("serializing manifest")?;
    let tmp = tmp_dir.join(tmp_name("manifest.json"));
    fs::write(&tmp, bytes)
        .with_context(|| format!("writing temp manifest '{}'", tmp.display()))?;
    atomic_rename(&tmp, path)
}

fn extract_tar_zst(blob: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(blob).with_context(|| format!("opening '{}'", blob.display()))?;
    let decoder = zstd::stream::Decoder::new(file)?;
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dest_dir)
        .with_context(|| format!("unpacking '{}'", blob.display()))
}

/// Archive a directory as a deterministic `tar.zst`: entries sorted by
/// relative path, mtime/uid/gid zeroed, permission bits preserved.
fn create_tar_zst(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out =
        File::create(out_path).with_context(|| format!("creating '{}'", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, 3)?;
    let mut builder = TarBuilder::new(encoder);

    let mut entries: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(src_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
    {
        if entry.path() == src_dir {
            continue;
        }
        entries.push(entry.path().to_path_buf());
    }
    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a).to_string_lossy();
        let rb = b.strip_prefix(src_dir).unwrap_or(b).to_string_lossy();
        ra.cmp(&rb)
    });

    for path in entries {
        let rel = path
            .strip_prefix(src_dir)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        let metadata = fs::symlink_metadata(&path)?;

        if metadata.is_dir() {
            let mut header = deterministic_header(&metadata, tar::EntryType::Directory, 0);
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if metadata.file_type().is_symlink() {
            let target = fs::read_link(&path)?;
            let mut header = deterministic_header(&metadata, tar::EntryType::Symlink, 0);
            header.set_link_name(target.to_string_lossy().as_ref())?;
            header.set_cksum();
            builder.append_data(&mut header, rel, std::io::empty())?;
        } else if metadata.is_file() {
            let mut file = File::open(&path)?;
            let mut header =
                deterministic_header(&metadata, tar::EntryType::Regular, metadata.len());
            header.set_cksum();
            builder.append_data(&mut header, rel, &mut file)?;
        }
    }

    let encoder = builder
        .into_inner()
        .context("finalizing tar builder")?;
    encoder.finish()?;
    Ok(())
}

fn deterministic_header(
    metadata: &fs::Metadata,
    entry_type: tar::EntryType,
    size: u64,
) -> tar::Header {
    use std::os::unix::fs::PermissionsExt;

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(metadata.permissions().mode());
    header
}
