use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use taric_types::ModTime;

use crate::error::{Operation, StoreError, StoreResult};
use crate::traits::{
    Metadata, ObjectInfo, ObjectReader, ObjectStat, PartReceipt, StorageBackend, UploadId,
    MODIFIED_KEY,
};

/// Chunk size used when streaming files off disk.
pub const DEFAULT_FS_CHUNK: usize = 64 * 1024;

/// Directory under the root holding in-progress multipart uploads.
const UPLOADS_DIR: &str = ".uploads";

/// Local filesystem backend.
///
/// Keys map onto paths below `root`. Entries whose name starts with `.` are
/// private to the backend (write staging, multipart parts) and never listed.
///
/// The filesystem cannot hold arbitrary object metadata. The one field this
/// service uses, [`MODIFIED_KEY`], is applied as the file's modification
/// time, so [`stat`](StorageBackend::stat) always reports an empty metadata
/// map and the timestamp shows up as `last_modified` instead.
#[derive(Clone, Debug)]
pub struct FsBackend {
    root: PathBuf,
    chunk_size: usize,
}

impl FsBackend {
    /// Open a backend rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            chunk_size: DEFAULT_FS_CHUNK,
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto a path below the root, rejecting anything that could
    /// escape it or collide with backend-private entries.
    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        let invalid = |reason: &str| StoreError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        if key.is_empty() {
            return Err(invalid("empty key"));
        }
        if key.contains('\\') || key.contains('\0') {
            return Err(invalid("contains a forbidden character"));
        }
        let mut path = self.root.clone();
        for component in key.split('/') {
            if component.is_empty() {
                return Err(invalid("empty path component"));
            }
            if component.starts_with('.') {
                return Err(invalid("path component starts with '.'"));
            }
            path.push(component);
        }
        Ok(path)
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(UPLOADS_DIR).join(upload_id)
    }

    /// Sibling path used to build a file before moving it into place.
    fn staging_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{name}.{}", uuid::Uuid::new_v4()))
    }

    async fn ensure_parent(path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Apply the `modified` metadata field, if any, as the file mtime.
    async fn apply_metadata(path: &Path, metadata: Option<&Metadata>) -> StoreResult<()> {
        let Some(metadata) = metadata else {
            return Ok(());
        };
        for key in metadata.keys().filter(|k| k.as_str() != MODIFIED_KEY) {
            debug!(field = %key, "filesystem backend ignores metadata field");
        }
        let Some(modified) = metadata.get(MODIFIED_KEY) else {
            return Ok(());
        };
        let time = match ModTime::parse(modified) {
            Ok(time) => time.to_system_time(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unparseable modified timestamp not applied");
                return Ok(());
            }
        };
        set_mtime(path.to_path_buf(), time).await
    }
}

/// Set a file's modification time.
async fn set_mtime(path: PathBuf, time: SystemTime) -> StoreResult<()> {
    let key = path.display().to_string();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_modified(time)
    })
    .await
    .map_err(|e| StoreError::backend(Operation::Write, key, e))??;
    Ok(())
}

fn not_found_or(key: &str) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |e| {
        if e.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound(key.to_string())
        } else {
            StoreError::Io(e)
        }
    }
}

/// `true` for walk errors caused by an entry disappearing mid-walk.
fn vanished(e: &walkdir::Error) -> bool {
    e.io_error().is_some_and(|io| io.kind() == io::ErrorKind::NotFound)
}

/// Walk `dir` and collect files whose key starts with `prefix`.
///
/// Files renamed or deleted between the directory read and the stat are
/// skipped; they belong to writers running alongside the listing.
fn walk(root: &Path, dir: &Path, prefix: &str) -> StoreResult<Vec<ObjectInfo>> {
    let mut objects = Vec::new();
    let walker = walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if vanished(&e) => continue,
            Err(e) => return Err(StoreError::backend(Operation::List, prefix, e)),
        };
        if let Some(object) = object_info(root, &entry, prefix)? {
            objects.push(object);
        }
    }
    objects.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(objects)
}

fn object_info(
    root: &Path,
    entry: &walkdir::DirEntry,
    prefix: &str,
) -> StoreResult<Option<ObjectInfo>> {
    if !entry.file_type().is_file() {
        return Ok(None);
    }
    let Ok(relative) = entry.path().strip_prefix(root) else {
        return Ok(None);
    };
    let key = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if !key.starts_with(prefix) {
        return Ok(None);
    }
    let meta = match entry.metadata() {
        Ok(meta) => meta,
        Err(e) if vanished(&e) => {
            debug!(key = %key, "file vanished during listing");
            return Ok(None);
        }
        Err(e) => return Err(StoreError::backend(Operation::List, &key, e)),
    };
    Ok(Some(ObjectInfo {
        size: meta.len(),
        last_modified: meta.modified()?,
        key,
    }))
}

/// Name of a write staging sibling: `.{name}.{uuid}`.
fn is_staging_name(name: &str) -> bool {
    name.strip_prefix('.')
        .and_then(|rest| rest.rsplit_once('.'))
        .is_some_and(|(_, suffix)| uuid::Uuid::parse_str(suffix).is_ok())
}

fn modified_before(path: &Path, cutoff: SystemTime) -> io::Result<bool> {
    Ok(std::fs::symlink_metadata(path)?.modified()? < cutoff)
}

/// Remove staging siblings and multipart directories last touched before
/// `cutoff`.
fn sweep(root: &Path, cutoff: SystemTime) -> io::Result<usize> {
    let mut removed = 0;

    match std::fs::read_dir(root.join(UPLOADS_DIR)) {
        Ok(uploads) => {
            for entry in uploads {
                let path = entry?.path();
                match modified_before(&path, cutoff) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e),
                }
                debug!(path = %path.display(), "removing abandoned multipart upload");
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let walker = walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || !e.file_type().is_dir() || !e.file_name().to_string_lossy().starts_with('.')
        });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if vanished(&e) => continue,
            Err(e) => return Err(e.into()),
        };
        if !entry.file_type().is_file() || !is_staging_name(&entry.file_name().to_string_lossy()) {
            continue;
        }
        match modified_before(entry.path(), cutoff) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
        debug!(path = %entry.path().display(), "removing abandoned staging file");
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

#[async_trait]
impl StorageBackend for FsBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let path = self.path_for(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn open_reader(&self, key: &str) -> StoreResult<ObjectReader> {
        let path = self.path_for(key)?;
        let file = fs::File::open(&path).await.map_err(not_found_or(key))?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        let chunk_size = self.chunk_size;

        let chunks = stream::try_unfold(file, move |mut file| async move {
            let mut buf = BytesMut::with_capacity(chunk_size);
            let n = file.read_buf(&mut buf).await?;
            if n == 0 {
                Ok::<_, io::Error>(None)
            } else {
                Ok(Some((buf.freeze(), file)))
            }
        });
        Ok(ObjectReader {
            size: meta.len(),
            stream: chunks.map_err(StoreError::from).boxed(),
        })
    }

    async fn write(&self, key: &str, data: Bytes, metadata: Option<Metadata>) -> StoreResult<()> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;

        // Build the file beside its destination so readers never see a
        // partially written object.
        let staging = Self::staging_path(&path);
        let result = async {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            Self::apply_metadata(&staging, metadata.as_ref()).await?;
            fs::rename(&staging, &path).await?;
            Ok::<_, StoreError>(())
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&staging).await;
        }
        result
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key)?;
        fs::remove_file(&path).await.map_err(not_found_or(key))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectInfo>> {
        // Start walking at the deepest directory the prefix names.
        let dir = match prefix.rsplit_once('/') {
            Some((parent, _)) if !parent.is_empty() => self.path_for(parent)?,
            _ => self.root.clone(),
        };
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let root = self.root.clone();
        let prefix = prefix.to_string();
        let key = prefix.clone();
        tokio::task::spawn_blocking(move || walk(&root, &dir, &prefix))
            .await
            .map_err(|e| StoreError::backend(Operation::List, key, e))?
    }

    async fn stat(&self, key: &str) -> StoreResult<ObjectStat> {
        let path = self.path_for(key)?;
        let meta = fs::metadata(&path).await.map_err(not_found_or(key))?;
        if !meta.is_file() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(ObjectStat {
            info: ObjectInfo {
                key: key.to_string(),
                size: meta.len(),
                last_modified: meta.modified()?,
            },
            metadata: Metadata::new(),
        })
    }

    async fn rename(&self, from: &str, to: &str, metadata: Option<Metadata>) -> StoreResult<()> {
        let source = self.path_for(from)?;
        let target = self.path_for(to)?;
        Self::ensure_parent(&target).await?;
        fs::rename(&source, &target).await.map_err(not_found_or(from))?;
        // The move already happened; a missing timestamp only changes the
        // reported issue date.
        if let Err(e) = Self::apply_metadata(&target, metadata.as_ref()).await {
            warn!(key = to, error = %e, "renamed, but the modification time was not applied");
        }
        Ok(())
    }

    async fn begin_upload(&self, key: &str) -> StoreResult<UploadId> {
        // Validate up front so a bad key fails before any part is sent.
        self.path_for(key)?;
        let id = uuid::Uuid::new_v4().to_string();
        fs::create_dir_all(self.upload_dir(&id)).await?;
        debug!(key, upload = %id, "multipart upload started");
        Ok(UploadId {
            key: key.to_string(),
            id,
        })
    }

    async fn upload_part(
        &self,
        upload: &UploadId,
        number: u32,
        data: Bytes,
    ) -> StoreResult<PartReceipt> {
        let dir = self.upload_dir(&upload.id);
        if !fs::try_exists(&dir).await? {
            return Err(StoreError::UnknownUpload(upload.id.clone()));
        }
        let len = data.len();
        fs::write(dir.join(format!("part-{number:05}")), data).await?;
        Ok(PartReceipt {
            number,
            etag: format!("{number}-{len}"),
        })
    }

    async fn complete_upload(&self, upload: &UploadId, parts: Vec<PartReceipt>) -> StoreResult<()> {
        let dir = self.upload_dir(&upload.id);
        if !fs::try_exists(&dir).await? {
            return Err(StoreError::UnknownUpload(upload.id.clone()));
        }
        let path = self.path_for(&upload.key)?;
        Self::ensure_parent(&path).await?;

        let staging = Self::staging_path(&path);
        let result = async {
            let mut out = fs::File::create(&staging).await?;
            for part in &parts {
                let part_path = dir.join(format!("part-{:05}", part.number));
                let mut input = fs::File::open(&part_path).await.map_err(|e| {
                    StoreError::backend(
                        Operation::Upload,
                        &upload.key,
                        format!("part {}: {e}", part.number),
                    )
                })?;
                tokio::io::copy(&mut input, &mut out).await?;
            }
            out.sync_all().await?;
            drop(out);
            fs::rename(&staging, &path).await?;
            Ok::<_, StoreError>(())
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&staging).await;
        }
        result?;
        fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    async fn abort_upload(&self, upload: &UploadId) -> StoreResult<()> {
        match fs::remove_dir_all(self.upload_dir(&upload.id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn sweep_staging(&self, older_than: Duration) -> StoreResult<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let root = self.root.clone();
        let key = root.display().to_string();
        let removed = tokio::task::spawn_blocking(move || sweep(&root, cutoff))
            .await
            .map_err(|e| StoreError::backend(Operation::Delete, key, e))??;
        Ok(removed)
    }
}
