use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;

use super::{ByteRange, ByteStream, ObjectMeta, ObjectStore, ObjectStoreError, CHUNK_SIZE};

/// Marker embedded in in-flight upload file names.
const TEMP_MARKER: &str = ".tmp-";

/// Local filesystem object store.
pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) a store rooted at `base_path`.
    /// Leftover temp files from uploads interrupted by a crash are removed.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        let removed = remove_stale_temp_files(&base_path)?;
        if removed > 0 {
            tracing::info!(count = removed, "Removed interrupted uploads from local store");
        }
        Ok(Self { base_path })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        debug_assert!(
            !key.split('/').any(|seg| seg == ".." || seg.is_empty()),
            "object keys must be relative and normalized"
        );
        self.base_path.join(key)
    }

    async fn open_existing(&self, key: &str) -> Result<tokio::fs::File, ObjectStoreError> {
        match tokio::fs::File::open(self.object_path(key)).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, key: &str, mut data: ByteStream) -> Result<u64, ObjectStoreError> {
        let path = self.object_path(key);
        let parent = path.parent().map(Path::to_path_buf);
        if let Some(ref parent) = parent {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut temp = TempUpload::new(temp_path_for(&path));
        let written = write_temp(&temp.path, &mut data).await?;
        tokio::fs::rename(&temp.path, &path).await?;
        temp.persisted();

        // Persist the directory entry so the rename survives a crash
        #[cfg(unix)]
        {
            if let Some(parent) = parent {
                tokio::fs::File::open(&parent).await?.sync_all().await?;
            }
        }

        Ok(written)
    }

    async fn get(&self, key: &str) -> Result<ByteStream, ObjectStoreError> {
        let file = self.open_existing(key).await?;
        Ok(ReaderStream::with_capacity(file, CHUNK_SIZE).boxed())
    }

    async fn get_range(
        &self,
        key: &str,
        ranges: &[ByteRange],
    ) -> Result<ByteStream, ObjectStoreError> {
        // Fail fast on a missing object; each range reopens the file lazily
        drop(self.open_existing(key).await?);

        let path = self.object_path(key);
        let stream = futures::stream::iter(ranges.to_vec())
            .then(move |range| {
                let path = path.clone();
                async move {
                    let mut file = tokio::fs::File::open(&path).await?;
                    file.seek(SeekFrom::Start(range.start)).await?;
                    Ok::<_, std::io::Error>(ReaderStream::with_capacity(
                        file.take(range.len()),
                        CHUNK_SIZE,
                    ))
                }
            })
            .try_flatten();

        Ok(stream.boxed())
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        match tokio::fs::remove_file(self.object_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError> {
        match tokio::fs::metadata(self.object_path(key)).await {
            Ok(meta) => Ok(Some(ObjectMeta {
                key: key.to_string(),
                size: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.base_path.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(key) = relative_key(&self.base_path, &path) else {
                    continue;
                };
                if !key.contains(TEMP_MARKER) && key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

/// In-flight upload file, removed on drop unless renamed into place.
/// Covers both failed writes and an upload future dropped mid-stream.
struct TempUpload {
    path: PathBuf,
    persisted: bool,
}

impl TempUpload {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    fn persisted(&mut self) {
        self.persisted = true;
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed partial upload"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove partial upload"
            ),
        }
    }
}

async fn write_temp(path: &Path, data: &mut ByteStream) -> Result<u64, std::io::Error> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = data.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!("{TEMP_MARKER}{}", uuid::Uuid::new_v4().simple()));
    PathBuf::from(name)
}

fn relative_key(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}

fn remove_stale_temp_files(base: &Path) -> Result<usize, std::io::Error> {
    let mut removed = 0;
    let mut pending = vec![base.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path);
            } else if entry.file_name().to_string_lossy().contains(TEMP_MARKER) {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}
