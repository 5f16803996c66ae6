//! Append-only, length-prefixed WAL file.
//!
//! Frame layout: `[u32 little-endian payload length][msgpack WalRecord]`. Every append is
//! followed by `sync_data` before it is acknowledged.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::entry::WalRecord;
use super::WalError;

const LEN_PREFIX: usize = 4;

/// Upper bound on an encoded record. A longer length prefix can only be corruption.
const MAX_FRAME_LEN: usize = 1024 * 1024;

pub struct WalLog {
    path: PathBuf,
    file: File,
    /// Length of the acknowledged prefix
    len: u64,
}

impl WalLog {
    /// Open the log, returning every intact record in append order.
    /// A torn final frame left by a crash mid-append is truncated away.
    pub async fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<WalRecord>), WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(WalError::Open)?;
        }

        let data = match File::open(&path).await {
            Ok(file) => read_image(file).await.map_err(WalError::Open)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(WalError::Open(e)),
        };

        let (records, valid_len) = decode_frames(&data)?;
        if valid_len < data.len() {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = data.len() - valid_len,
                "Discarding torn WAL tail"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(WalError::Open)?;
            file.set_len(valid_len as u64).await.map_err(WalError::Open)?;
            file.sync_all().await.map_err(WalError::Open)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(WalError::Open)?;

        Ok((
            Self {
                path,
                file,
                len: valid_len as u64,
            },
            records,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record durably.
    pub async fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        let frame = encode_frame(record)?;

        if let Err(e) = self.write_frame(&frame).await {
            // Drop whatever part of the frame made it out so later frames stay aligned
            if let Err(truncate_err) = self.file.set_len(self.len).await {
                tracing::error!(error = %truncate_err, "Failed to truncate WAL after write error");
            }
            return Err(WalError::from_write(e));
        }
        self.len += frame.len() as u64;
        Ok(())
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), std::io::Error> {
        self.file.write_all(frame).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Atomically replace the whole log with `records`.
    pub async fn rewrite(&mut self, records: &[WalRecord]) -> Result<(), WalError> {
        let mut buf = Vec::new();
        for record in records {
            buf.extend_from_slice(&encode_frame(record)?);
        }

        let temp_path = self.path.with_extension("compact");
        let mut temp = File::create(&temp_path)
            .await
            .map_err(WalError::from_write)?;
        temp.write_all(&buf).await.map_err(WalError::from_write)?;
        temp.sync_all().await.map_err(WalError::from_write)?;
        drop(temp);

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(WalError::from_write)?;

        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(WalError::from_write)?;
        self.len = buf.len() as u64;
        Ok(())
    }
}

/// The log's bytes as of opening, bounded by its reported length.
async fn read_image(file: File) -> Result<Vec<u8>, std::io::Error> {
    let len = file.metadata().await?.len();
    let mut data = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut data).await?;
    Ok(data)
}

fn encode_frame(record: &WalRecord) -> Result<Vec<u8>, WalError> {
    let payload = rmp_serde::to_vec_named(record)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(WalError::Corrupt {
            offset: 0,
            reason: format!("record of {} bytes exceeds frame limit", payload.len()),
        });
    }
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode frames from a log image. Returns the records and the length of the intact prefix.
fn decode_frames(data: &[u8]) -> Result<(Vec<WalRecord>, usize), WalError> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let Some(len_bytes) = data.get(offset..offset + LEN_PREFIX) else {
            break; // torn length prefix
        };
        let mut len_buf = [0u8; LEN_PREFIX];
        len_buf.copy_from_slice(len_bytes);
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(WalError::Corrupt {
                offset: offset as u64,
                reason: format!("frame length {len} exceeds {MAX_FRAME_LEN}"),
            });
        }

        let start = offset + LEN_PREFIX;
        let Some(payload) = data.get(start..start + len) else {
            break; // torn payload, necessarily the final frame
        };

        match rmp_serde::from_slice::<WalRecord>(payload) {
            Ok(record) => records.push(record),
            // A garbled final frame is a torn write; anywhere else it is corruption
            Err(_) if start + len == data.len() => break,
            Err(e) => {
                return Err(WalError::Corrupt {
                    offset: offset as u64,
                    reason: e.to_string(),
                })
            }
        }
        offset = start + len;
    }

    Ok((records, offset))
}
