//! Persisted configuration (spec §6.3's `ConfigStore`, §6.4's schema) and
//! the signing-key helpers the CLI needs for `--genconf`/`--autoconf`/
//! `--exportkey`.
//!
//! Grounded on `zerotier-system-service::datadir::DataDir`: a thin wrapper
//! around a single file, read once at open and rewritten wholesale on
//! save, rather than a directory of many small files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use meshnode_httpapi::ConfigPersist;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Parse(#[from] deser_hjson::Error),
    #[error("invalid private key: {0}")]
    Key(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetworkDomainConfig {
    pub prefix: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DdnsServerConfig {
    pub tld: Option<String>,
    pub listen_address: Option<String>,
    pub upstream_servers: Vec<String>,
}

/// The recognized fields of the single config file (spec §6.4). Unknown
/// keys are accepted and ignored by `deser-hjson`'s default struct
/// handling rather than rejected, matching the reference implementation's
/// tolerance of forward-incompatible config.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NodeConfig {
    pub peers: Vec<String>,
    pub interface_peers: HashMap<String, Vec<String>>,
    pub listen: Vec<String>,
    pub http_address: Option<String>,
    pub www_root: Option<String>,
    pub multicast_interfaces: Vec<String>,
    pub allowed_public_keys: Vec<String>,
    pub private_key: Option<String>,
    pub private_key_path: Option<String>,
    pub if_name: Option<String>,
    #[serde(rename = "IfMTU")]
    pub if_mtu: Option<usize>,
    pub node_info_privacy: Option<bool>,
    pub node_info: Option<serde_json::Value>,
    pub network_domain: NetworkDomainConfig,
    pub public_peers_url: Option<String>,
    pub domain: Option<String>,
    #[serde(rename = "DDnsServer")]
    pub ddns_server: Option<DdnsServerConfig>,
}

/// Transcodes a UTF-16 BOM-prefixed buffer to UTF-8 and parses it as
/// HJSON/JSON (spec §6.3, §9). Buffers with no recognized BOM are assumed
/// already UTF-8, which also covers plain JSON produced by `--json`.
pub fn parse_bytes(bytes: &[u8]) -> Result<NodeConfig, ConfigError> {
    let text = transcode(bytes);
    Ok(deser_hjson::from_str(&text)?)
}

fn transcode(bytes: &[u8]) -> std::borrow::Cow<'_, str> {
    if bytes.starts_with(&[0xFF, 0xFE]) {
        let (text, _, _) = encoding_rs::UTF_16LE.decode(&bytes[2..]);
        std::borrow::Cow::Owned(text.into_owned())
    } else if bytes.starts_with(&[0xFE, 0xFF]) {
        let (text, _, _) = encoding_rs::UTF_16BE.decode(&bytes[2..]);
        std::borrow::Cow::Owned(text.into_owned())
    } else {
        String::from_utf8_lossy(bytes)
    }
}

/// `deser-hjson` is parse-only; writing back out as pretty JSON is valid
/// HJSON (HJSON is a superset) and is what keeps `read(write(cfg)) = cfg`
/// exact instead of round-tripping through a lossy re-serializer.
pub fn to_bytes(config: &NodeConfig) -> Result<Vec<u8>, ConfigError> {
    Ok(serde_json::to_vec_pretty(config).expect("NodeConfig always serializes"))
}

/// Reads and writes the single persisted config file (spec §6.3).
pub struct ConfigStore;

impl ConfigStore {
    pub async fn read(path: &Path) -> Result<NodeConfig, ConfigError> {
        let bytes = tokio::fs::read(path).await?;
        parse_bytes(&bytes)
    }

    pub async fn write(path: &Path, config: &NodeConfig) -> Result<(), ConfigError> {
        let bytes = to_bytes(config)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

/// Generates a fresh Ed25519 signing key for `--genconf`/`--autoconf`.
pub fn generate_signing_key() -> SigningKey {
    let mut csprng = rand::rngs::OsRng;
    SigningKey::generate(&mut csprng)
}

/// `--exportkey`: PEM-encode the raw 32-byte seed. Not a PKCS#8 document —
/// just enough structure for the key to round-trip through `parse_private_key_pem`.
pub fn export_private_key_pem(key: &SigningKey) -> String {
    let der = key.to_bytes();
    pem::encode(&pem::Pem::new("PRIVATE KEY", der.to_vec()))
}

pub fn parse_private_key_pem(text: &str) -> Result<SigningKey, ConfigError> {
    let parsed = pem::parse(text).map_err(|e| ConfigError::Key(e.to_string()))?;
    let bytes: [u8; 32] = parsed
        .contents()
        .try_into()
        .map_err(|_| ConfigError::Key("expected a 32-byte Ed25519 seed".into()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Short hex fingerprint logged at startup so operators can confirm which
/// identity came up without printing the full public key.
pub fn key_fingerprint(public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(public_key);
    hex::encode(&digest[..8])
}

/// Concrete `ConfigPersist` for the control HTTP API (spec scenario S6):
/// `PUT /api/peers` / nodeinfo mutations with `Riv-Save-Config: true`
/// read-modify-write the same file the node was started from.
pub struct FileConfigPersist {
    path: PathBuf,
}

impl FileConfigPersist {
    pub fn new(path: PathBuf) -> Self {
        FileConfigPersist { path }
    }

    async fn load_or_default(&self) -> std::io::Result<NodeConfig> {
        match ConfigStore::read(&self.path).await {
            Ok(config) => Ok(config),
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(NodeConfig::default()),
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        }
    }

    async fn save(&self, config: NodeConfig) -> std::io::Result<()> {
        ConfigStore::write(&self.path, &config)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

#[async_trait]
impl ConfigPersist for FileConfigPersist {
    async fn persist_peers(&self, peers: Vec<String>) -> std::io::Result<()> {
        let mut config = self.load_or_default().await?;
        config.peers = peers;
        self.save(config).await
    }

    async fn persist_nodeinfo(&self, nodeinfo: serde_json::Value) -> std::io::Result<()> {
        let mut config = self.load_or_default().await?;
        config.node_info = Some(nodeinfo);
        self.save(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> NodeConfig {
        NodeConfig {
            peers: vec!["tcp://example.com:9000".into()],
            listen: vec!["tcp://[::]:9000".into()],
            http_address: Some("127.0.0.1:9993".into()),
            if_mtu: Some(2800),
            network_domain: NetworkDomainConfig { prefix: Some(0xFD) },
            ddns_server: Some(DdnsServerConfig {
                tld: Some("mesh.".into()),
                listen_address: Some("0.0.0.0:53".into()),
                upstream_servers: vec!["1.1.1.1:853".into()],
            }),
            ..Default::default()
        }
    }

    #[test]
    fn round_trips_through_write_then_read() {
        let original = sample_config();
        let bytes = to_bytes(&original).unwrap();
        let parsed = parse_bytes(&bytes).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn parses_hjson_comments_and_unquoted_keys() {
        let hjson = r#"{
            // a comment
            Peers: ["tcp://a:1"]
            IfMTU: 1400
        }"#;
        let config = parse_bytes(hjson.as_bytes()).unwrap();
        assert_eq!(config.peers, vec!["tcp://a:1".to_string()]);
        assert_eq!(config.if_mtu, Some(1400));
    }

    #[test]
    fn transcodes_utf16_le_bom() {
        let (encoded, _, _) = encoding_rs::UTF_16LE.encode(r#"{"Peers": ["tcp://a:1"]}"#);
        let mut bytes = vec![0xFF, 0xFE];
        bytes.extend_from_slice(&encoded);
        let config = parse_bytes(&bytes).unwrap();
        assert_eq!(config.peers, vec!["tcp://a:1".to_string()]);
    }

    #[test]
    fn private_key_pem_round_trips() {
        let key = generate_signing_key();
        let pem_text = export_private_key_pem(&key);
        let parsed = parse_private_key_pem(&pem_text).unwrap();
        assert_eq!(key.to_bytes(), parsed.to_bytes());
    }

    #[test]
    fn fingerprint_is_stable_for_same_key() {
        let key = generate_signing_key();
        let public = key.verifying_key().to_bytes();
        assert_eq!(key_fingerprint(&public), key_fingerprint(&public));
    }

    #[tokio::test]
    async fn file_config_persist_creates_default_when_missing() {
        let path = std::env::temp_dir().join(format!("meshnode-config-test-{}.conf", std::process::id()));
        let persist = FileConfigPersist::new(path.clone());
        persist.persist_peers(vec!["tcp://a:1".into()]).await.unwrap();
        let saved = ConfigStore::read(&path).await.unwrap();
        assert_eq!(saved.peers, vec!["tcp://a:1".to_string()]);
        let _ = tokio::fs::remove_file(&path).await;
    }
}
