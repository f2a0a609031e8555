use coffre_core::{Checksum, Error, RepositoryConfig, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

pub const DEFAULT_PORT: u16 = 9876;
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// One framed record: request UUID correlating request and response, plus
/// the payload drawn from the closed packet set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub uuid: Uuid,
    pub packet: Packet,
}

/// Every request/response shape the wire recognizes. The challenge pair is
/// defined but never exercised; no server performs the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Packet {
    ReqChallenge { public_key: Vec<u8> },
    ResChallenge { challenge: Vec<u8> },
    ReqChallengeResponse { signature: Vec<u8> },
    ResChallengeResponse { authenticated: bool },

    ReqCreate { path: String, config: RepositoryConfig },
    ResCreate { err: Option<String> },
    ReqOpen { path: String },
    ResOpen { config: Option<RepositoryConfig>, err: Option<String> },

    ReqGetIndexes,
    ResGetIndexes { indexes: Vec<Uuid>, err: Option<String> },
    ReqGetChunks,
    ResGetChunks { chunks: Vec<Checksum>, err: Option<String> },
    ReqGetObjects,
    ResGetObjects { objects: Vec<Checksum>, err: Option<String> },

    ReqGetMetadata { uuid: Uuid },
    ResGetMetadata { data: Vec<u8>, err: Option<String> },
    ReqGetIndex { uuid: Uuid },
    ResGetIndex { data: Vec<u8>, err: Option<String> },
    ReqGetChunk { checksum: Checksum },
    ResGetChunk { data: Vec<u8>, err: Option<String> },
    ReqGetObject { checksum: Checksum },
    ResGetObject { data: Vec<u8>, err: Option<String> },

    ReqCheckChunk { checksum: Checksum },
    ResCheckChunk { exists: bool, err: Option<String> },
    ReqCheckObject { checksum: Checksum },
    ResCheckObject { exists: bool, err: Option<String> },

    ReqGetChunkSize { checksum: Checksum },
    ResGetChunkSize { size: u64, err: Option<String> },
    ReqGetObjectSize { checksum: Checksum },
    ResGetObjectSize { size: u64, err: Option<String> },
    ReqGetChunkRefCount { checksum: Checksum },
    ResGetChunkRefCount { ref_count: u64, err: Option<String> },
    ReqGetObjectRefCount { checksum: Checksum },
    ResGetObjectRefCount { ref_count: u64, err: Option<String> },

    ReqPurge { uuid: Uuid },
    ResPurge { err: Option<String> },

    ReqTransaction,
    ResTransaction { uuid: Uuid, err: Option<String> },
    ReqReferenceChunks { transaction: Uuid, keys: Vec<Checksum> },
    ResReferenceChunks { exists: Vec<bool>, err: Option<String> },
    ReqReferenceObjects { transaction: Uuid, keys: Vec<Checksum> },
    ResReferenceObjects { exists: Vec<bool>, err: Option<String> },
    ReqPutChunk { transaction: Uuid, checksum: Checksum, data: Vec<u8> },
    ResPutChunk { err: Option<String> },
    ReqPutObject { transaction: Uuid, checksum: Checksum, data: Vec<u8> },
    ResPutObject { err: Option<String> },
    ReqPutIndex { transaction: Uuid, data: Vec<u8> },
    ResPutIndex { err: Option<String> },
    ReqPutMetadata { transaction: Uuid, data: Vec<u8> },
    ResPutMetadata { err: Option<String> },
    ReqCommit { transaction: Uuid },
    ResCommit { err: Option<String> },

    ReqClose,
    ResClose { err: Option<String> },
}

/// Write one length-delimited frame: 4-byte big-endian payload length,
/// then the bincode payload.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload =
        bincode::serialize(message).map_err(|e| Error::Backend(format!("encode: {}", e)))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(Error::Backend(format!(
            "message of {} bytes exceeds frame limit",
            payload.len()
        )));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; a cleanly closed stream surfaces as `TransportClosed`.
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::TransportClosed)
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::Corrupt(format!("frame of {} bytes exceeds limit", len)));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::TransportClosed
        } else {
            Error::from(e)
        }
    })?;
    bincode::deserialize(&payload).map_err(|e| Error::Corrupt(format!("malformed frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffre_core::storage::Compression;

    async fn roundtrip(packet: Packet) -> Packet {
        let message = Message {
            uuid: Uuid::new_v4(),
            packet,
        };
        let mut buffer = Vec::new();
        write_message(&mut buffer, &message).await.unwrap();
        let decoded = read_message(&mut buffer.as_slice()).await.unwrap();
        assert_eq!(decoded.uuid, message.uuid);
        decoded.packet
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let checksum = Checksum::from_data(b"chunk");
        match roundtrip(Packet::ReqPutChunk {
            transaction: Uuid::new_v4(),
            checksum,
            data: vec![1, 2, 3],
        })
        .await
        {
            Packet::ReqPutChunk { checksum: c, data, .. } => {
                assert_eq!(c, checksum);
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[tokio::test]
    async fn config_roundtrip() {
        let config = RepositoryConfig::new(Compression::Gzip, Some(Uuid::new_v4()));
        match roundtrip(Packet::ResOpen {
            config: Some(config.clone()),
            err: None,
        })
        .await
        {
            Packet::ResOpen { config: Some(c), err: None } => {
                assert_eq!(c.uuid, config.uuid);
                assert_eq!(c.encryption, config.encryption);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[tokio::test]
    async fn closed_stream_reports_transport_closed() {
        let mut empty: &[u8] = &[];
        assert!(matches!(
            read_message(&mut empty).await,
            Err(Error::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn truncated_frame_reports_transport_closed() {
        let message = Message {
            uuid: Uuid::new_v4(),
            packet: Packet::ReqGetChunks,
        };
        let mut buffer = Vec::new();
        write_message(&mut buffer, &message).await.unwrap();
        buffer.truncate(buffer.len() - 1);
        assert!(matches!(
            read_message(&mut buffer.as_slice()).await,
            Err(Error::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes());
        assert!(matches!(
            read_message(&mut buffer.as_slice()).await,
            Err(Error::Corrupt(_))
        ));
    }
}
