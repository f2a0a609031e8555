use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// SHA-256 digest identifying a chunk or object by its plaintext content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn new(digest: [u8; 32]) -> Self {
        Self(digest)
    }

    pub fn from_data(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self(digest.into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First two hex characters, used for 256-way directory sharding.
    pub fn bucket(&self) -> String {
        format!("{:02x}", self.0[0])
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }
}

impl FromStr for Checksum {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes);
        Ok(Self(digest))
    }
}

impl Serialize for Checksum {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Checksum::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Descriptor of one file: the ordered chunks that reconstruct it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    pub checksum: Checksum,
    pub chunks: Vec<Checksum>,
    pub content_type: String,
}

impl Object {
    /// Build a descriptor and derive its identity: SHA-256 over the ordered
    /// chunk checksums and the content type.
    pub fn new(chunks: Vec<Checksum>, content_type: String) -> Self {
        let mut hasher = Sha256::new();
        for chunk in &chunks {
            hasher.update(chunk.as_bytes());
        }
        hasher.update(content_type.as_bytes());
        Self {
            checksum: Checksum::new(hasher.finalize().into()),
            chunks,
            content_type,
        }
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| crate::Error::Corrupt(format!("malformed object descriptor: {}", e)))
    }
}

/// One deduplicated byte range within a file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Chunk {
    pub checksum: Checksum,
    pub start: u64,
    pub length: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_hex_roundtrip() {
        let sum = Checksum::from_data(b"hello");
        let parsed: Checksum = sum.to_hex().parse().unwrap();
        assert_eq!(sum, parsed);
    }

    #[test]
    fn checksum_is_sha256() {
        let sum = Checksum::from_data(b"hello");
        assert_eq!(
            sum.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(sum.bucket(), "2c");
    }

    #[test]
    fn checksum_rejects_short_input() {
        assert!("2cf24d".parse::<Checksum>().is_err());
    }

    #[test]
    fn object_roundtrip() {
        let object = Object {
            checksum: Checksum::from_data(b"descriptor"),
            chunks: vec![Checksum::from_data(b"a"), Checksum::from_data(b"b")],
            content_type: "text/plain".to_string(),
        };
        let decoded = Object::from_bytes(&object.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.chunks, object.chunks);
        assert_eq!(decoded.content_type, object.content_type);
    }
}
