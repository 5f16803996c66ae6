//! Stream adapters that hash content while it flows through.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::{future, stream, StreamExt, TryStreamExt};
use parking_lot::Mutex;

use crate::checksum::{ContentDigest, ContentHasher};
use crate::node::NodeState;
use crate::object_store::ByteStream;

#[derive(Default)]
struct MeterState {
    hasher: ContentHasher,
    exceeded: bool,
    /// First error produced by the incoming content itself
    source_error: Option<String>,
}

/// Hashes an upload and cuts it off once it passes `limit` bytes.
///
/// The wrapped stream is consumed by the backend; the meter keeps the shared state so the
/// digest and the limit outcome can be read afterwards.
pub struct UploadMeter {
    state: Arc<Mutex<MeterState>>,
    limit: u64,
}

impl UploadMeter {
    pub fn new(limit: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MeterState::default())),
            limit,
        }
    }

    pub fn wrap(&self, content: ByteStream) -> ByteStream {
        let source_state = Arc::clone(&self.state);
        let state = Arc::clone(&self.state);
        let limit = self.limit;
        content
            .map_err(move |e| {
                source_state
                    .lock()
                    .source_error
                    .get_or_insert_with(|| e.to_string());
                e
            })
            .and_then(move |chunk| {
                let mut state = state.lock();
                let result = if state.hasher.len() + chunk.len() as u64 > limit {
                    state.exceeded = true;
                    Err(io::Error::other(format!("upload exceeds {limit} bytes")))
                } else {
                    state.hasher.update(&chunk);
                    Ok(chunk)
                };
                future::ready(result)
            })
            .boxed()
    }

    pub fn exceeded(&self) -> bool {
        self.state.lock().exceeded
    }

    /// Set when the upload ended because its source failed, not the backend.
    pub fn source_error(&self) -> Option<String> {
        self.state.lock().source_error.clone()
    }

    pub fn finish(self) -> ContentDigest {
        std::mem::take(&mut self.state.lock().hasher).finish()
    }
}

/// Pass `content` through unchanged, failing at the end if it does not hash to `checksum`.
/// A mismatch quarantines `file_id`.
pub fn verified(
    content: ByteStream,
    file_id: String,
    checksum: String,
    size_bytes: u64,
    node: Arc<NodeState>,
) -> ByteStream {
    let hasher = Arc::new(Mutex::new(ContentHasher::new()));
    let tail_hasher = Arc::clone(&hasher);

    let body = content.inspect_ok(move |chunk| hasher.lock().update(chunk));
    let check = stream::once(async move {
        let digest = std::mem::take(&mut *tail_hasher.lock()).finish();
        if digest.checksum == checksum && digest.size_bytes == size_bytes {
            return None;
        }
        let reason = format!(
            "content hashes to {} ({} bytes), expected {} ({} bytes)",
            digest.checksum, digest.size_bytes, checksum, size_bytes
        );
        node.quarantine(&file_id, reason.clone());
        Some(Err::<Bytes, _>(io::Error::new(io::ErrorKind::InvalidData, reason)))
    })
    .filter_map(future::ready);

    body.chain(check).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::digest_bytes;
    use crate::mode::NodeMode;
    use crate::object_store::collect_stream;

    fn chunks(parts: &[&'static [u8]]) -> ByteStream {
        let parts: Vec<Bytes> = parts.iter().map(|&p| Bytes::from_static(p)).collect();
        stream::iter(parts.into_iter().map(Ok)).boxed()
    }

    #[tokio::test]
    async fn test_meter_hashes_within_limit() {
        let meter = UploadMeter::new(10);
        let data = collect_stream(meter.wrap(chunks(&[b"hello", b"world"])))
            .await
            .unwrap();

        assert_eq!(&data[..], b"helloworld");
        assert!(!meter.exceeded());
        assert_eq!(meter.finish(), digest_bytes(b"helloworld"));
    }

    #[tokio::test]
    async fn test_meter_cuts_off_over_limit() {
        let meter = UploadMeter::new(8);
        let result = collect_stream(meter.wrap(chunks(&[b"hello", b"world"]))).await;

        assert!(result.is_err());
        assert!(meter.exceeded());
        assert_eq!(meter.source_error(), None);
    }

    #[tokio::test]
    async fn test_meter_records_source_failure() {
        let meter = UploadMeter::new(100);
        let content = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ])
        .boxed();

        assert!(collect_stream(meter.wrap(content)).await.is_err());
        assert!(!meter.exceeded());
        assert!(meter.source_error().unwrap().contains("client went away"));
    }

    #[tokio::test]
    async fn test_verified_stream_detects_mismatch() {
        let node = Arc::new(NodeState::new("n", NodeMode::Edit, 100, 1));
        let good = digest_bytes(b"abc");

        let ok = verified(
            chunks(&[b"a", b"bc"]),
            "f1".into(),
            good.checksum.clone(),
            3,
            Arc::clone(&node),
        );
        assert_eq!(&collect_stream(ok).await.unwrap()[..], b"abc");
        assert!(!node.is_quarantined("f1"));

        let bad = verified(chunks(&[b"abd"]), "f2".into(), good.checksum, 3, Arc::clone(&node));
        let err = collect_stream(bad).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(node.is_quarantined("f2"));
    }
}
