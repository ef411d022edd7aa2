//! Missed port counter file
//!
//! Layout, one 18 byte line per port 1..=65535:
//!
//! ```text
//! "%5d " port | "%5d" tcp count | "|" | "%5d" udp count | "\n"
//! ```
//!
//! so the TCP count of port `p` lives at `(p - 1) * 18 + 6` and the UDP count
//! six bytes later. Counts are updated in place and saturate at 99999.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::record::Protocol;

const PORT_SLOTS: u64 = 65535;
const PORT_FIELD: u64 = 6;
const COUNT_WIDTH: usize = 5;
const LINE_LENGTH: u64 = PORT_FIELD + COUNT_WIDTH as u64 + 1 + COUNT_WIDTH as u64 + 1;
const FILE_SIZE: u64 = LINE_LENGTH * PORT_SLOTS;
const MAX_COUNT: u32 = 99_999;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter file I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("counter file is corrupted at {protocol} port {port}: got {raw:?}")]
    Corrupt {
        port: u16,
        protocol: Protocol,
        raw: String,
    },

    #[error("port 0 has no counter slot")]
    NoSlot,
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortCounts {
    pub tcp: u32,
    pub udp: u32,
}

pub struct MissedPortStore {
    file: File,
}

impl MissedPortStore {
    /// Open the counter file, writing a zeroed table if it is absent or undersized
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut store = Self { file };
        if store.file.metadata()?.len() < FILE_SIZE {
            info!("Setting up {}", path.display());
            store.initialize()?;
        }
        Ok(store)
    }

    fn initialize(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut writer = BufWriter::new(&self.file);
        for port in 1..=PORT_SLOTS {
            writeln!(
                writer,
                "{:>5} {:>w$}|{:>w$}",
                port,
                0,
                0,
                w = COUNT_WIDTH
            )?;
        }
        writer.flush()?;
        drop(writer);
        self.file.sync_all()
    }

    fn offset(port: u16, protocol: Protocol) -> Result<u64, StoreError> {
        if port == 0 {
            return Err(StoreError::NoSlot);
        }
        let line = (port as u64 - 1) * LINE_LENGTH + PORT_FIELD;
        Ok(match protocol {
            Protocol::Tcp => line,
            Protocol::Udp => line + COUNT_WIDTH as u64 + 1,
        })
    }

    fn read_field(&mut self, port: u16, protocol: Protocol) -> Result<u32, StoreError> {
        let offset = Self::offset(port, protocol)?;
        let mut raw = [0u8; COUNT_WIDTH];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut raw)?;

        let corrupt = || StoreError::Corrupt {
            port,
            protocol,
            raw: String::from_utf8_lossy(&raw).into_owned(),
        };
        let text = std::str::from_utf8(&raw).map_err(|_| corrupt())?.trim();
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(corrupt());
        }
        text.parse::<u32>().map_err(|_| corrupt())
    }

    /// Add one hit for `port`, returning the new count
    pub fn increment(&mut self, protocol: Protocol, port: u16) -> Result<u32, StoreError> {
        let count = (self.read_field(port, protocol)? + 1).min(MAX_COUNT);

        let offset = Self::offset(port, protocol)?;
        let encoded = format!("{:>w$}", count, w = COUNT_WIDTH);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(encoded.as_bytes())?;
        self.file.sync_data()?;

        Ok(count)
    }

    #[cfg(test)]
    pub fn counts(&mut self, port: u16) -> Result<PortCounts, StoreError> {
        Ok(PortCounts {
            tcp: self.read_field(port, Protocol::Tcp)?,
            udp: self.read_field(port, Protocol::Udp)?,
        })
    }
}
