//! Capture records handed to the recorders

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use crate::geoip::GeoLocation;

/// Timestamp layout expected by existing record consumers
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the peer sent: escaped inline text, or the spill file holding it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Inline(String),
    File(PathBuf),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Inline(String::new())
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Inline(text) => f.write_str(text),
            Payload::File(path) => write!(f, "Input sent to file {}", path.display()),
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Represents one completed connection or datagram
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    #[serde(serialize_with = "serialize_time")]
    pub time: DateTime<Utc>,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub port: u16,
    pub input: Payload,
    pub is_binary: bool,
    pub use_ssl: bool,
    pub location: Option<GeoLocation>,
    pub host: String,
}

fn serialize_time<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&time.format(TIME_FORMAT))
}

impl Record {
    pub fn new(protocol: Protocol, peer: SocketAddr, port: u16, host: &str) -> Self {
        Self {
            time: Utc::now(),
            remote_ip: peer.ip(),
            remote_port: peer.port(),
            protocol,
            port,
            input: Payload::default(),
            is_binary: false,
            use_ssl: false,
            location: None,
            host: host.to_string(),
        }
    }

    /// Store raw bytes in their escaped, printable form
    pub fn with_bytes(self, bytes: &[u8]) -> Self {
        let escaped = escape(bytes);
        self.with_payload(Payload::Inline(escaped.text), escaped.binary)
    }

    pub fn with_payload(mut self, payload: Payload, is_binary: bool) -> Self {
        self.input = payload;
        self.is_binary = is_binary;
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    pub fn with_tls(mut self, use_ssl: bool) -> Self {
        self.use_ssl = use_ssl;
        self
    }

    pub fn with_geo(mut self, location: Option<GeoLocation>) -> Self {
        self.location = location;
        self
    }
}

pub struct Escaped {
    pub text: String,
    pub binary: bool,
}

/// Escape a payload into printable text, quoting style: `\n`, `\"`, `\x00`, `\u200b`.
/// Bytes that are not valid UTF-8 are written as `\xNN`.
pub fn escape(bytes: &[u8]) -> Escaped {
    let mut text = String::with_capacity(bytes.len());
    let mut binary = false;

    for chunk in bytes.utf8_chunks() {
        for c in chunk.valid().chars() {
            match c {
                '\x07' => text.push_str("\\a"),
                '\x08' => text.push_str("\\b"),
                '\x0c' => text.push_str("\\f"),
                '\n' => text.push_str("\\n"),
                '\r' => text.push_str("\\r"),
                '\t' => text.push_str("\\t"),
                '\x0b' => text.push_str("\\v"),
                '\\' => text.push_str("\\\\"),
                '"' => text.push_str("\\\""),
                c if (c as u32) < 0x20 || c == '\x7f' => {
                    binary = true;
                    text.push_str(&format!("\\x{:02x}", c as u32));
                }
                c if c.is_control() || is_invisible(c) => {
                    binary = true;
                    if (c as u32) < 0x10000 {
                        text.push_str(&format!("\\u{:04x}", c as u32));
                    } else {
                        text.push_str(&format!("\\U{:08x}", c as u32));
                    }
                }
                c => text.push(c),
            }
        }
        for b in chunk.invalid() {
            binary = true;
            text.push_str(&format!("\\x{:02x}", b));
        }
    }

    if !binary {
        binary = has_control_bytes(bytes);
    }

    Escaped { text, binary }
}

/// Format characters and separators that render as nothing
fn is_invisible(c: char) -> bool {
    matches!(c, '\u{200b}'..='\u{200f}' | '\u{2028}'..='\u{202e}' | '\u{2060}'..='\u{2064}' | '\u{feff}')
}

/// True for control bytes other than tab, CR and LF
pub fn has_control_bytes(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .any(|&b| (b < 0x20 && !matches!(b, b'\t' | b'\r' | b'\n')) || b == 0x7f)
}
