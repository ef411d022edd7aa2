//! GeoIP lookup module using MaxMind GeoLite2 database

use maxminddb::{geoip2, Reader};
use serde::Serialize;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// GeoIP lookup result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
    pub country_code: String,
}

/// GeoIP reader wrapper
pub struct GeoIp {
    reader: Option<Reader<Vec<u8>>>,
}

impl GeoIp {
    /// Create a new GeoIP instance, loading the database if available
    pub fn new(database_path: &str) -> Self {
        let path = Path::new(database_path);

        if !path.exists() {
            warn!("GeoIP database not found at: {}", database_path);
            warn!("Download GeoLite2-City.mmdb from MaxMind and place it at: {}", database_path);
            return Self::disabled();
        }

        match Reader::open_readfile(path) {
            Ok(reader) => {
                info!("GeoIP database loaded: {}", database_path);
                Self { reader: Some(reader) }
            }
            Err(e) => {
                warn!("Failed to load GeoIP database: {}", e);
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self { reader: None }
    }

    /// Look up an address; coordinates are rounded to two decimals
    pub fn lookup(&self, ip: IpAddr) -> Option<GeoLocation> {
        let reader = self.reader.as_ref()?;

        if is_private_ip(&ip) {
            return None;
        }

        let city: geoip2::City = reader.lookup(ip).ok()?;

        let country_code = city
            .country
            .as_ref()
            .and_then(|c| c.iso_code)
            .unwrap_or("XX")
            .to_string();

        let location = city.location.as_ref()?;

        Some(GeoLocation {
            lat: round2(location.latitude?),
            lon: round2(location.longitude?),
            country_code,
        })
    }

    /// Check if the GeoIP database is loaded
    pub fn is_available(&self) -> bool {
        self.reader.is_some()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Check if an IP address is private/local
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()
                || ipv4.is_loopback()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_documentation()
                || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => ipv6.is_loopback() || ipv6.is_unspecified(),
    }
}

/// Thread-safe GeoIP wrapper
pub type SharedGeoIp = Arc<GeoIp>;
