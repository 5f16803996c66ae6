//! Incremental SHA-256 content digests.

use futures::StreamExt;
use ring::digest;

use crate::object_store::ByteStream;

/// Running SHA-256 over streamed content, with a byte count.
pub struct ContentHasher {
    context: digest::Context,
    len: u64,
}

/// Finished digest of a piece of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    /// Lowercase hex SHA-256
    pub checksum: String,
    pub size_bytes: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            context: digest::Context::new(&digest::SHA256),
            len: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.context.update(chunk);
        self.len += chunk.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finish(self) -> ContentDigest {
        ContentDigest {
            checksum: hex::encode(self.context.finish().as_ref()),
            size_bytes: self.len,
        }
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Digest a complete in-memory buffer.
pub fn digest_bytes(data: &[u8]) -> ContentDigest {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finish()
}

/// Consume a stream, hashing it chunk by chunk.
pub async fn digest_stream(mut stream: ByteStream) -> Result<ContentDigest, std::io::Error> {
    let mut hasher = ContentHasher::new();
    while let Some(chunk) = stream.next().await {
        hasher.update(&chunk?);
    }
    Ok(hasher.finish())
}
