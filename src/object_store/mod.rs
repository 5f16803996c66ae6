mod gcs;
mod local;

pub use gcs::GcsStore;
pub use local::LocalStore;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

/// Lazy, finite, forward-only sequence of content chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// Size of the chunks produced when reading blobs back.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Linux `ENOSPC`.
pub(crate) const ENOSPC: i32 = 28;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Backend rejected request ({status}): {body}")]
    Status { status: u16, body: String },
}

impl ObjectStoreError {
    /// True when the backend ran out of space, as opposed to a transient failure.
    pub fn is_out_of_space(&self) -> bool {
        match self {
            ObjectStoreError::Io(e) => e.raw_os_error() == Some(ENOSPC),
            ObjectStoreError::Status { status, .. } => *status == 507,
            _ => false,
        }
    }
}

/// Inclusive byte range `[start, end]` within an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "range start must not exceed end");
        Self { start, end }
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
}

/// Abstraction over content storage backends.
/// Keys are derived from file UUIDs; the raw blobs are meaningless without their sidecars.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stream `data` into `key`, replacing any previous object. Returns the number of bytes written.
    /// The object only becomes visible under `key` once the stream has been fully persisted.
    async fn put(&self, key: &str, data: ByteStream) -> Result<u64, ObjectStoreError>;

    /// Stream the whole object.
    async fn get(&self, key: &str) -> Result<ByteStream, ObjectStoreError>;

    /// Stream exactly the bytes covered by `ranges`, in the order given.
    /// Callers pass ranges already clamped to the object length.
    async fn get_range(&self, key: &str, ranges: &[ByteRange])
        -> Result<ByteStream, ObjectStoreError>;

    /// Remove an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;

    async fn stat(&self, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError>;

    /// List every key starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    fn backend_name(&self) -> &'static str;
}

/// Backend-relative key of a file's content blob: `<first two chars>/<id>`.
pub fn blob_key(file_id: &str) -> String {
    let shard = file_id.get(..2).unwrap_or(file_id);
    format!("{shard}/{file_id}")
}

/// Key of the attribute sidecar stored next to a blob.
pub fn sidecar_key(file_id: &str) -> String {
    format!("{}{SIDECAR_SUFFIX}", blob_key(file_id))
}

pub const SIDECAR_SUFFIX: &str = ".attr";

/// Wrap an in-memory buffer as a single-chunk [`ByteStream`].
pub fn once_stream(data: Bytes) -> ByteStream {
    use futures::StreamExt;
    futures::stream::once(async move { Ok(data) }).boxed()
}

/// Drain a stream into one contiguous buffer. Only used for small objects such as sidecars.
pub async fn collect_stream(mut stream: ByteStream) -> Result<Bytes, std::io::Error> {
    use futures::StreamExt;
    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}
