use crate::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

// Argon2id parameters for the passphrase-derived key wrapping the keypair
// file: 64 MiB, 1 pass, 4 lanes.
const KDF_MEMORY: u32 = 65536;
const KDF_ITERATIONS: u32 = 1;
const KDF_PARALLELISM: u32 = 4;

/// Per-user identity: an Ed25519 signing pair plus a symmetric master key
/// under which repository secrets are wrapped. The whole structure is
/// persisted passphrase-wrapped in the workdir.
pub struct Keypair {
    pub uuid: Uuid,
    pub creation_time: DateTime<Utc>,
    signing: ed25519_dalek::SigningKey,
    key: [u8; KEY_LEN],
}

#[derive(Serialize, Deserialize)]
struct SerializedKeypair {
    creation_time: DateTime<Utc>,
    uuid: Uuid,
    private_key: String,
    public_key: String,
    key: String,
}

impl Keypair {
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        let signing = ed25519_dalek::SigningKey::generate(&mut csprng);
        let mut key = [0u8; KEY_LEN];
        csprng.fill_bytes(&mut key);
        Self {
            uuid: Uuid::new_v4(),
            creation_time: Utc::now(),
            signing,
            key,
        }
    }

    pub fn public_key(&self) -> ed25519_dalek::VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.signing.verifying_key().to_bytes())
    }

    /// The symmetric master key wrapping repository secrets.
    pub fn master_key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Wrap the keypair under a passphrase: Argon2id-derived key, AEAD
    /// envelope, salt and nonce carried in the clear prefix.
    pub fn seal(&self, passphrase: &[u8]) -> Result<Vec<u8>> {
        let serialized = serde_json::to_vec(&SerializedKeypair {
            creation_time: self.creation_time,
            uuid: self.uuid,
            private_key: BASE64.encode(self.signing.to_bytes()),
            public_key: BASE64.encode(self.signing.verifying_key().to_bytes()),
            key: BASE64.encode(self.key),
        })?;

        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let derived = derive_key(passphrase, &salt)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&derived));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, serialized.as_slice())
            .map_err(|_| Error::AuthFailed)?;

        let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(passphrase: &[u8], data: &[u8]) -> Result<Self> {
        if data.len() < SALT_LEN + NONCE_LEN {
            return Err(Error::BadPassphrase);
        }
        let (salt, rest) = data.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let derived = derive_key(passphrase, salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&derived));
        let serialized = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::BadPassphrase)?;

        let parsed: SerializedKeypair = serde_json::from_slice(&serialized)?;
        let private = decode_key(&parsed.private_key)?;
        let key = decode_key(&parsed.key)?;
        Ok(Self {
            uuid: parsed.uuid,
            creation_time: parsed.creation_time,
            signing: ed25519_dalek::SigningKey::from_bytes(&private),
            key,
        })
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({})", self.uuid)
    }
}

/// Per-repository master secret; every persisted blob is encrypted under it.
#[derive(Clone)]
pub struct Secret {
    pub uuid: Uuid,
    pub creation_time: DateTime<Utc>,
    key: [u8; KEY_LEN],
}

#[derive(Serialize, Deserialize)]
struct SerializedSecret {
    creation_time: DateTime<Utc>,
    uuid: Uuid,
    key: String,
}

impl Secret {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            uuid: Uuid::new_v4(),
            creation_time: Utc::now(),
            key,
        }
    }

    /// Wrap the secret under the keypair's master key.
    pub fn seal(&self, keypair: &Keypair) -> Result<Vec<u8>> {
        let serialized = serde_json::to_vec(&SerializedSecret {
            creation_time: self.creation_time,
            uuid: self.uuid,
            key: BASE64.encode(self.key),
        })?;
        encrypt_raw(keypair.master_key(), &serialized)
    }

    pub fn open(keypair: &Keypair, data: &[u8]) -> Result<Self> {
        let serialized = decrypt_raw(keypair.master_key(), data)?;
        let parsed: SerializedSecret = serde_json::from_slice(&serialized)?;
        Ok(Self {
            uuid: parsed.uuid,
            creation_time: parsed.creation_time,
            key: decode_key(&parsed.key)?,
        })
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret({})", self.uuid)
    }
}

/// AEAD-encrypt a blob under the repository secret. Output is
/// nonce || ciphertext.
pub fn encrypt(secret: &Secret, plaintext: &[u8]) -> Result<Vec<u8>> {
    encrypt_raw(&secret.key, plaintext)
}

/// Inverse of [`encrypt`]; fails with [`Error::AuthFailed`] on tamper.
pub fn decrypt(secret: &Secret, data: &[u8]) -> Result<Vec<u8>> {
    decrypt_raw(&secret.key, data)
}

fn encrypt_raw(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| Error::AuthFailed)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_raw(key: &[u8; KEY_LEN], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(Error::AuthFailed);
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::AuthFailed)
}

fn derive_key(passphrase: &[u8], salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let params = Params::new(KDF_MEMORY, KDF_ITERATIONS, KDF_PARALLELISM, Some(KEY_LEN))
        .map_err(|e| Error::Backend(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; KEY_LEN];
    argon2
        .hash_password_into(passphrase, salt, &mut out)
        .map_err(|e| Error::Backend(e.to_string()))?;
    Ok(out)
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| Error::Corrupt(format!("malformed key material: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| Error::Corrupt("key material has wrong length".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_roundtrip() {
        let secret = Secret::generate();
        let plaintext = b"hello, coffre";
        let ciphertext = encrypt(&secret, plaintext).unwrap();
        assert_eq!(decrypt(&secret, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn decrypt_detects_tamper() {
        let secret = Secret::generate();
        let mut ciphertext = encrypt(&secret, b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(matches!(
            decrypt(&secret, &ciphertext),
            Err(Error::AuthFailed)
        ));
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let ciphertext = encrypt(&Secret::generate(), b"payload").unwrap();
        assert!(matches!(
            decrypt(&Secret::generate(), &ciphertext),
            Err(Error::AuthFailed)
        ));
    }

    #[test]
    fn keypair_seal_open() {
        let keypair = Keypair::generate();
        let sealed = keypair.seal(b"hunter2").unwrap();
        let opened = Keypair::open(b"hunter2", &sealed).unwrap();
        assert_eq!(opened.uuid, keypair.uuid);
        assert_eq!(opened.master_key(), keypair.master_key());
        assert_eq!(opened.public_key(), keypair.public_key());
    }

    #[test]
    fn keypair_open_bad_passphrase() {
        let sealed = Keypair::generate().seal(b"hunter2").unwrap();
        assert!(matches!(
            Keypair::open(b"wrong", &sealed),
            Err(Error::BadPassphrase)
        ));
    }

    #[test]
    fn secret_seal_open() {
        let keypair = Keypair::generate();
        let secret = Secret::generate();
        let sealed = secret.seal(&keypair).unwrap();
        let opened = Secret::open(&keypair, &sealed).unwrap();
        assert_eq!(opened.uuid, secret.uuid);
        assert_eq!(opened.key, secret.key);
    }

    #[test]
    fn secret_open_wrong_keypair() {
        let sealed = Secret::generate().seal(&Keypair::generate()).unwrap();
        assert!(Secret::open(&Keypair::generate(), &sealed).is_err());
    }
}
