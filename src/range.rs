//! HTTP byte-range handling: `Range` parsing and normalization, conditional request
//! matching, and lazily streamed `multipart/byteranges` bodies.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};

use crate::object_store::{ByteRange, ByteStream, ObjectStore};

/// What a `Range` header asks for once checked against the content length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable range: serve the whole entity
    Full,
    /// Satisfiable ranges, sorted by start with overlaps merged
    Partial(Vec<ByteRange>),
    /// Well-formed, but no range overlaps the content
    Unsatisfiable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeSpec {
    /// `first-last` or `first-`
    Bounded { first: u64, last: Option<u64> },
    /// `-suffix_len`
    Suffix(u64),
}

/// Interpret a `Range` header value for an entity of `len` bytes.
///
/// Malformed values and units other than `bytes` yield [`RangeRequest::Full`].
pub fn parse_range(header: &str, len: u64) -> RangeRequest {
    let Some(specs) = parse_specs(header) else {
        return RangeRequest::Full;
    };

    let ranges: Vec<ByteRange> = specs
        .into_iter()
        .filter_map(|spec| resolve(spec, len))
        .collect();

    if ranges.is_empty() {
        RangeRequest::Unsatisfiable
    } else {
        RangeRequest::Partial(normalize(ranges))
    }
}

fn parse_specs(header: &str) -> Option<Vec<RangeSpec>> {
    let (unit, set) = header.trim().split_once('=')?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return None;
    }

    let mut specs = Vec::new();
    for part in set.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (first, last) = part.split_once('-')?;
        let (first, last) = (first.trim(), last.trim());

        let spec = if first.is_empty() {
            RangeSpec::Suffix(last.parse().ok()?)
        } else {
            let first: u64 = first.parse().ok()?;
            let last = if last.is_empty() {
                None
            } else {
                Some(last.parse::<u64>().ok()?)
            };
            if last.is_some_and(|last| last < first) {
                return None;
            }
            RangeSpec::Bounded { first, last }
        };
        specs.push(spec);
    }

    (!specs.is_empty()).then_some(specs)
}

fn resolve(spec: RangeSpec, len: u64) -> Option<ByteRange> {
    if len == 0 {
        return None;
    }
    match spec {
        RangeSpec::Bounded { first, last } => {
            if first >= len {
                return None;
            }
            let end = last.map_or(len - 1, |last| last.min(len - 1));
            Some(ByteRange::new(first, end))
        }
        RangeSpec::Suffix(0) => None,
        RangeSpec::Suffix(n) => Some(ByteRange::new(len.saturating_sub(n), len - 1)),
    }
}

/// Sort by start and merge overlapping ranges. Adjacent ranges stay separate parts.
fn normalize(mut ranges: Vec<ByteRange>) -> Vec<ByteRange> {
    ranges.sort_by_key(|r| (r.start, r.end));

    let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(prev) if range.start <= prev.end => prev.end = prev.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

pub fn content_range(range: &ByteRange, len: u64) -> String {
    format!("bytes {}-{}/{}", range.start, range.end, len)
}

/// `Content-Range` value for a 416 response.
pub fn unsatisfied_range(len: u64) -> String {
    format!("bytes */{len}")
}

/// `If-None-Match` evaluation using weak comparison.
pub fn none_match(header: &str, etag: &str) -> bool {
    let etag = etag.trim_start_matches("W/");
    header.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate.trim_start_matches("W/") == etag
    })
}

/// Whether an `If-Range` precondition lets the `Range` header apply.
/// Entity tags use strong comparison; a date must equal `last_modified` to the second.
pub fn if_range_holds(header: &str, etag: &str, last_modified: DateTime<Utc>) -> bool {
    let header = header.trim();
    if header.starts_with('"') {
        return header == etag;
    }
    if header.starts_with("W/") {
        return false;
    }
    DateTime::parse_from_rfc2822(header)
        .map(|date| date.timestamp() == last_modified.timestamp())
        .unwrap_or(false)
}

/// Format a timestamp as an HTTP-date.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Precomputed framing for a `multipart/byteranges` body so its length is known up front.
#[derive(Debug, Clone)]
pub struct MultipartLayout {
    boundary: String,
    parts: Vec<(Bytes, ByteRange)>,
    closing: Bytes,
}

impl MultipartLayout {
    pub fn new(ranges: &[ByteRange], len: u64, mime_type: &str) -> Self {
        let boundary = uuid::Uuid::new_v4().simple().to_string();
        let parts = ranges
            .iter()
            .map(|range| {
                let head = format!(
                    "\r\n--{boundary}\r\nContent-Type: {mime_type}\r\nContent-Range: {}\r\n\r\n",
                    content_range(range, len)
                );
                (Bytes::from(head), *range)
            })
            .collect();
        let closing = Bytes::from(format!("\r\n--{boundary}--\r\n"));

        Self {
            boundary,
            parts,
            closing,
        }
    }

    pub fn content_type(&self) -> String {
        format!("multipart/byteranges; boundary={}", self.boundary)
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_length(&self) -> u64 {
        let parts: u64 = self
            .parts
            .iter()
            .map(|(head, range)| head.len() as u64 + range.len())
            .sum();
        parts + self.closing.len() as u64
    }

    /// Stream the body, opening each part's range only when the previous one is done.
    pub fn into_stream(self, store: Arc<dyn ObjectStore>, key: String) -> ByteStream {
        let closing = self.closing;
        stream::iter(self.parts)
            .then(move |(head, range)| {
                let store = Arc::clone(&store);
                let key = key.clone();
                async move {
                    let body = store
                        .get_range(&key, &[range])
                        .await
                        .map_err(std::io::Error::other)?;
                    Ok::<_, std::io::Error>(stream::once(async move { Ok(head) }).chain(body))
                }
            })
            .try_flatten()
            .chain(stream::once(async move { Ok(closing) }))
            .boxed()
    }
}
