//! Peer health probing (spec §4.9/§6.3): TCP-connect with a 5s deadline and
//! best-effort geolocation of the remote IP.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

const PROBE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct GeoInfo {
    pub country_short: String,
    pub country_long: String,
}

/// Geolocation lookup collaborator (spec §6.3's `Geo database`): "absence
/// is non-fatal", so every call site treats a missing database, or a miss
/// within it, the same way — empty country fields.
pub trait GeoDatabase: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo>;
}

/// Backed by a MaxMind GeoLite2-Country-shaped database.
pub struct MaxMindGeoDatabase {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxMindGeoDatabase {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let reader = maxminddb::Reader::open_readfile(path)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(MaxMindGeoDatabase { reader })
    }
}

impl GeoDatabase for MaxMindGeoDatabase {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo> {
        let record: maxminddb::geoip2::Country<'_> = self.reader.lookup(ip).ok()?;
        let country = record.country?;
        let country_short = country.iso_code.unwrap_or_default().to_string();
        let country_long = country
            .names
            .and_then(|names| names.get("en").copied())
            .unwrap_or_default()
            .to_string();
        Some(GeoInfo {
            country_short,
            country_long,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResult {
    pub host: String,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub country_short: String,
    pub country_long: String,
}

/// Resolves `host` (a `host:port` pair), TCP-connects with a 5s deadline,
/// and reports latency plus best-effort geolocation of whichever resolved
/// address was actually dialed.
pub async fn probe_host(host: &str, geo: Option<&dyn GeoDatabase>) -> HealthResult {
    let addrs = match tokio::net::lookup_host(host).await {
        Ok(addrs) => addrs.collect::<Vec<_>>(),
        Err(e) => {
            tracing::debug!(%host, error = %e, "health probe: dns resolution failed");
            return unreachable_result(host);
        }
    };
    let addr = match addrs.into_iter().next() {
        Some(addr) => addr,
        None => return unreachable_result(host),
    };

    let start = Instant::now();
    let connect = tokio::net::TcpStream::connect(addr);
    let result = match tokio::time::timeout(PROBE_DEADLINE, connect).await {
        Ok(Ok(_stream)) => Some(start.elapsed().as_millis() as u64),
        Ok(Err(e)) => {
            tracing::debug!(%host, error = %e, "health probe: connect failed");
            None
        }
        Err(_) => {
            tracing::debug!(%host, "health probe: connect timed out");
            None
        }
    };

    let geo_info = geo.and_then(|g| g.lookup(addr.ip()));
    HealthResult {
        host: host.to_string(),
        reachable: result.is_some(),
        latency_ms: result,
        country_short: geo_info.as_ref().map(|g| g.country_short.clone()).unwrap_or_default(),
        country_long: geo_info.as_ref().map(|g| g.country_long.clone()).unwrap_or_default(),
    }
}

fn unreachable_result(host: &str) -> HealthResult {
    HealthResult {
        host: host.to_string(),
        reachable: false,
        latency_ms: None,
        country_short: String::new(),
        country_long: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_result_has_no_latency_or_geo() {
        let result = unreachable_result("203.0.113.1:9999");
        assert!(!result.reachable);
        assert!(result.latency_ms.is_none());
        assert!(result.country_short.is_empty());
    }

    #[tokio::test]
    async fn probe_host_with_unresolvable_name_is_unreachable() {
        let result = probe_host("this.name.does.not.resolve.invalid:1", None).await;
        assert!(!result.reachable);
    }
}
