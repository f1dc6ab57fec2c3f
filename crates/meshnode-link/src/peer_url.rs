//! A minimal peer URL: `scheme://host:port[,host:port...]`. The comma form
//! is the multipath shape (spec §4.3): an adapter that sees more than one
//! endpoint dials them in parallel and keeps whichever completes first.
//!
//! No corpus crate does URL parsing of this shape (ZeroTier addresses
//! peers by `InetAddress`, not URL), so this is a small hand-rolled parser
//! rather than pulling in a general-purpose URL crate for four characters
//! of syntax.

use crate::LinkError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerUrl {
    pub scheme: String,
    pub endpoints: Vec<String>,
}

impl PeerUrl {
    pub fn parse(raw: &str) -> Result<Self, LinkError> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| LinkError::InvalidUrl(raw.to_string()))?;
        if scheme.is_empty() || rest.is_empty() {
            return Err(LinkError::InvalidUrl(raw.to_string()));
        }
        let endpoints: Vec<String> = rest.split(',').map(|s| s.to_string()).collect();
        if endpoints.iter().any(|e| e.is_empty()) {
            return Err(LinkError::InvalidUrl(raw.to_string()));
        }
        Ok(PeerUrl {
            scheme: scheme.to_string(),
            endpoints,
        })
    }

    /// Canonical key form used for link-uniqueness comparisons (spec §3:
    /// a peer is identified by `(uri, sourceInterface)`).
    pub fn canonical(&self) -> String {
        format!("{}://{}", self.scheme, self.endpoints.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_endpoint() {
        let url = PeerUrl::parse("tcp://1.2.3.4:5").unwrap();
        assert_eq!(url.scheme, "tcp");
        assert_eq!(url.endpoints, vec!["1.2.3.4:5"]);
    }

    #[test]
    fn parses_multipath_endpoints() {
        let url = PeerUrl::parse("mpath://a:1,b:2,c:3").unwrap();
        assert_eq!(url.endpoints, vec!["a:1", "b:2", "c:3"]);
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(PeerUrl::parse("1.2.3.4:5").is_err());
    }

    #[test]
    fn rejects_empty_endpoint() {
        assert!(PeerUrl::parse("tcp://a:1,,b:2").is_err());
    }
}
