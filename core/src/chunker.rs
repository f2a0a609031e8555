use crate::types::Checksum;
use fastcdc::v2020::FastCDC;

const DEFAULT_AVG_SIZE: u32 = 4 * 1024 * 1024;

/// Content-defined chunker: turns a file's bytes into `(checksum, bytes)`
/// pairs for the storage engine. Cut points depend only on content, so
/// identical ranges dedup across files and snapshots.
pub struct Chunker {
    min_size: u32,
    avg_size: u32,
    max_size: u32,
}

impl Chunker {
    pub fn new(avg_size: u32) -> Self {
        Self {
            min_size: avg_size / 4,
            avg_size,
            max_size: avg_size * 4,
        }
    }

    pub fn chunk_data(&self, data: &[u8]) -> Vec<FileChunk> {
        let chunker = FastCDC::new(data, self.min_size, self.avg_size, self.max_size);
        chunker
            .map(|cut| {
                let bytes = data[cut.offset..cut.offset + cut.length].to_vec();
                FileChunk {
                    checksum: Checksum::from_data(&bytes),
                    offset: cut.offset as u64,
                    data: bytes,
                }
            })
            .collect()
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_AVG_SIZE)
    }
}

#[derive(Debug, Clone)]
pub struct FileChunk {
    pub checksum: Checksum,
    pub offset: u64,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_cover_input() {
        let chunker = Chunker::new(1024);
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let chunks = chunker.chunk_data(&data);

        assert!(!chunks.is_empty());
        let total: usize = chunks.iter().map(|c| c.data.len()).sum();
        assert_eq!(total, data.len());

        let mut offset = 0u64;
        for chunk in &chunks {
            assert_eq!(chunk.offset, offset);
            assert_eq!(chunk.checksum, Checksum::from_data(&chunk.data));
            offset += chunk.data.len() as u64;
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let chunker = Chunker::new(1024);
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
        let first: Vec<_> = chunker.chunk_data(&data).iter().map(|c| c.checksum).collect();
        let second: Vec<_> = chunker.chunk_data(&data).iter().map(|c| c.checksum).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(Chunker::default().chunk_data(&[]).is_empty());
    }
}
