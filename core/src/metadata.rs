use crate::types::Checksum;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Per-snapshot header: provenance, the index integrity checksum, and
/// aggregate statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub uuid: Uuid,
    pub version: u32,
    pub creation_time: DateTime<Utc>,
    pub hostname: String,
    pub username: String,
    pub command_line: String,
    pub machine_id: String,
    /// Ed25519 public half of the creating user's keypair, base64. Carried
    /// opaque; metadata is not signed.
    pub public_key: String,
    /// SHA-256 of the index plaintext, bound at commit.
    pub checksum: Checksum,
    pub index_size: u64,
    pub statistics: Statistics,
}

impl Metadata {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            version: crate::storage::VERSION,
            creation_time: Utc::now(),
            hostname: String::new(),
            username: String::new(),
            command_line: String::new(),
            machine_id: String::new(),
            public_key: String::new(),
            checksum: Checksum::new([0u8; 32]),
            index_size: 0,
            statistics: Statistics::default(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::Corrupt(format!("malformed metadata: {}", e)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub chunks: u64,
    pub objects: u64,
    pub files: u64,
    pub directories: u64,

    pub kind: BTreeMap<String, u64>,
    #[serde(rename = "type")]
    pub content_type: BTreeMap<String, u64>,
    pub extension: BTreeMap<String, u64>,

    pub percent_kind: BTreeMap<String, f64>,
    pub percent_type: BTreeMap<String, f64>,
    pub percent_extension: BTreeMap<String, f64>,
}

impl Statistics {
    /// Account one file under its content type and extension buckets.
    pub fn record_file(&mut self, content_type: &str, extension: &str) {
        self.files += 1;
        let kind = content_type.split('/').next().unwrap_or("").to_string();
        *self.kind.entry(kind).or_default() += 1;
        *self.content_type.entry(content_type.to_string()).or_default() += 1;
        *self.extension.entry(extension.to_string()).or_default() += 1;
    }

    /// Derive the percent maps from the counters; called once at commit.
    pub fn compute_percentages(&mut self) {
        let files = self.files;
        self.percent_kind = percentages(&self.kind, files);
        self.percent_type = percentages(&self.content_type, files);
        self.percent_extension = percentages(&self.extension, files);
    }
}

fn percentages(counters: &BTreeMap<String, u64>, total: u64) -> BTreeMap<String, f64> {
    if total == 0 {
        return BTreeMap::new();
    }
    counters
        .iter()
        .map(|(key, count)| (key.clone(), *count as f64 * 100.0 / total as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_roundtrip() {
        let mut metadata = Metadata::new(Uuid::new_v4());
        metadata.hostname = "host".into();
        metadata.checksum = Checksum::from_data(b"index");
        let decoded = Metadata::from_bytes(&metadata.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.uuid, metadata.uuid);
        assert_eq!(decoded.checksum, metadata.checksum);
        assert_eq!(decoded.version, crate::storage::VERSION);
    }

    #[test]
    fn statistics_percentages() {
        let mut stats = Statistics::default();
        stats.record_file("text/plain", "txt");
        stats.record_file("text/html", "html");
        stats.record_file("application/octet-stream", "bin");
        stats.record_file("text/plain", "txt");
        stats.compute_percentages();

        assert_eq!(stats.files, 4);
        assert_eq!(stats.kind["text"], 3);
        assert_eq!(stats.percent_kind["text"], 75.0);
        assert_eq!(stats.percent_extension["txt"], 50.0);
        assert_eq!(stats.content_type["text/plain"], 2);
    }

    #[test]
    fn empty_statistics_have_no_percentages() {
        let mut stats = Statistics::default();
        stats.compute_percentages();
        assert!(stats.percent_kind.is_empty());
    }
}
