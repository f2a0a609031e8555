use crate::crypto::{self, Secret};
use crate::storage::{Compression, RepositoryConfig};
use crate::Result;

/// Envelope codec applied to every blob the repository persists:
/// `encrypt(compress(plaintext))` on write, the inverse on read.
#[derive(Clone)]
pub struct Pipeline {
    compression: Compression,
    secret: Option<Secret>,
}

impl Pipeline {
    pub fn new(config: &RepositoryConfig, secret: Option<Secret>) -> Self {
        Self {
            compression: config.compression,
            secret,
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut buffer = match self.compression {
            Compression::None => plaintext.to_vec(),
            Compression::Gzip => crate::compress::deflate(plaintext),
        };
        if let Some(secret) = &self.secret {
            buffer = crypto::encrypt(secret, &buffer)?;
        }
        Ok(buffer)
    }

    pub fn unseal(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut buffer = match &self.secret {
            Some(secret) => crypto::decrypt(secret, data)?,
            None => data.to_vec(),
        };
        if self.compression == Compression::Gzip {
            buffer = crate::compress::inflate(&buffer)?;
        }
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use uuid::Uuid;

    fn config(compression: Compression, encrypted: bool) -> RepositoryConfig {
        RepositoryConfig::new(compression, encrypted.then(Uuid::new_v4))
    }

    #[test]
    fn roundtrip_all_modes() {
        let plaintext = b"pipeline roundtrip payload".repeat(64);
        for compression in [Compression::None, Compression::Gzip] {
            for secret in [None, Some(Secret::generate())] {
                let pipeline = Pipeline::new(&config(compression, secret.is_some()), secret);
                let sealed = pipeline.seal(&plaintext).unwrap();
                assert_eq!(pipeline.unseal(&sealed).unwrap(), plaintext);
            }
        }
    }

    #[test]
    fn sealed_blob_is_opaque_when_encrypted() {
        let secret = Secret::generate();
        let pipeline = Pipeline::new(&config(Compression::Gzip, true), Some(secret));
        let sealed = pipeline.seal(b"secret contents").unwrap();
        assert!(!sealed.windows(6).any(|w| w == b"secret"));
    }

    #[test]
    fn unseal_detects_tamper() {
        let secret = Secret::generate();
        let pipeline = Pipeline::new(&config(Compression::Gzip, true), Some(secret));
        let mut sealed = pipeline.seal(b"payload").unwrap();
        sealed[20] ^= 0x01;
        assert!(matches!(pipeline.unseal(&sealed), Err(Error::AuthFailed)));
    }

    #[test]
    fn unseal_detects_corruption_without_encryption() {
        let pipeline = Pipeline::new(&config(Compression::Gzip, false), None);
        let mut sealed = pipeline.seal(&b"payload".repeat(100)).unwrap();
        let mid = sealed.len() / 2;
        sealed[mid] ^= 0xff;
        assert!(matches!(pipeline.unseal(&sealed), Err(Error::Corrupt(_))));
    }
}
