use crate::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    encoder.write_all(data).expect("gzip write to Vec");
    encoder.finish().expect("gzip finish to Vec")
}

pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Corrupt(format!("inflate failed: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let plaintext = b"hello, compressed world".repeat(32);
        let compressed = deflate(&plaintext);
        assert_eq!(inflate(&compressed).unwrap(), plaintext);
    }

    #[test]
    fn roundtrip_empty() {
        assert_eq!(inflate(&deflate(b"")).unwrap(), b"");
    }

    #[test]
    fn inflate_rejects_garbage() {
        assert!(matches!(
            inflate(b"definitely not gzip"),
            Err(crate::Error::Corrupt(_))
        ));
    }

    #[test]
    fn inflate_rejects_truncation() {
        let compressed = deflate(b"some data worth compressing, repeated a few times over");
        assert!(inflate(&compressed[..compressed.len() / 2]).is_err());
    }
}
