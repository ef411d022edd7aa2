//! Bounded TCP stream capture with disk spillover
//!
//! Bytes are buffered in memory until the running total reaches the spill
//! threshold. From then on the buffered prefix and every later chunk go to an
//! append-only file under the spill directory, and the record references that
//! file instead of carrying the payload. Reading stops at EOF, on a read
//! error, or once the total reaches the cap; the chunk that crosses the cap is
//! kept whole, so at most `chunk_size - 1` bytes of slack are recorded.

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::record::{escape, has_control_bytes, Payload};

#[derive(Debug, Clone, Copy)]
pub struct CaptureLimits {
    pub chunk_size: usize,
    pub spill_threshold: usize,
    pub max_bytes: usize,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            spill_threshold: 4096,
            max_bytes: 40 * 1024,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CaptureEnd {
    PeerClosed,
    ReadError(io::ErrorKind),
    CapReached,
    SpillFailed,
}

#[derive(Debug)]
pub struct CaptureOutcome {
    pub payload: Payload,
    pub is_binary: bool,
    pub bytes: usize,
    pub end: CaptureEnd,
}

struct Spill {
    file: File,
    path: PathBuf,
}

impl Spill {
    async fn create(dir: &Path, port: u16, started: DateTime<Utc>) -> io::Result<Self> {
        let stamp = started
            .timestamp_nanos_opt()
            .unwrap_or_else(|| started.timestamp_micros() * 1000);
        let base = format!("tcp-{}-{}", port, stamp);

        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{}.large", base)
            } else {
                format!("{}-{}.large", base, attempt)
            };
            let path = dir.join(name);

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o444)
                .open(&path)
                .await
            {
                Ok(file) => return Ok(Self { file, path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < 16 => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes).await
    }

    async fn finish(mut self) -> PathBuf {
        if let Err(e) = self.file.flush().await {
            warn!("Could not flush {}: {}", self.path.display(), e);
        }
        self.path
    }
}

/// Read `stream` until EOF, error or the cap. Never fails: whatever was read is returned.
pub async fn capture_stream<S>(
    stream: &mut S,
    port: u16,
    started: DateTime<Utc>,
    limits: &CaptureLimits,
    spill_dir: &Path,
) -> CaptureOutcome
where
    S: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; limits.chunk_size.max(1)];
    let mut buffer = BytesMut::with_capacity(limits.spill_threshold);
    let mut spill: Option<Spill> = None;
    let mut total = 0usize;
    let mut binary = false;

    let end = loop {
        if total >= limits.max_bytes {
            break CaptureEnd::CapReached;
        }

        let n = match stream.read(&mut chunk).await {
            Ok(0) => break CaptureEnd::PeerClosed,
            Ok(n) => n,
            Err(e) => {
                debug!("Read on port {} ended: {}", port, e);
                break CaptureEnd::ReadError(e.kind());
            }
        };
        let data = &chunk[..n];
        total += n;
        binary |= has_control_bytes(data);

        if let Some(file) = spill.as_mut() {
            if let Err(e) = file.append(data).await {
                warn!("Could not write {}: {}", file.path.display(), e);
                break CaptureEnd::SpillFailed;
            }
            continue;
        }

        if total < limits.spill_threshold {
            buffer.extend_from_slice(data);
            continue;
        }

        // Threshold crossed: move the buffered prefix and this chunk to disk
        let mut file = match Spill::create(spill_dir, port, started).await {
            Ok(file) => file,
            Err(e) => {
                warn!("Could not open large file in {}: {}", spill_dir.display(), e);
                total -= n;
                break CaptureEnd::SpillFailed;
            }
        };
        let written = match file.append(&buffer).await {
            Ok(()) => file.append(data).await,
            Err(e) => Err(e),
        };
        buffer.clear();
        let write_error = written.err();
        if let Some(e) = &write_error {
            warn!("Could not write {}: {}", file.path.display(), e);
        }
        spill = Some(file);
        if write_error.is_some() {
            break CaptureEnd::SpillFailed;
        }
    };

    let payload = match spill {
        Some(file) => Payload::File(file.finish().await),
        None => {
            let escaped = escape(&buffer);
            binary |= escaped.binary;
            Payload::Inline(escaped.text)
        }
    };

    CaptureOutcome {
        payload,
        is_binary: binary,
        bytes: total,
        end,
    }
}
