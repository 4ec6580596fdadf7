use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Cuts the capture stream into fixed-duration frames and encodes each one
/// as base64 little-endian 16-bit PCM.
pub struct AudioChunker {
    samples_per_chunk: usize,
    buffer: Vec<i16>,
}

impl AudioChunker {
    pub fn new(samples_per_chunk: usize) -> Self {
        let samples_per_chunk = samples_per_chunk.max(1);
        Self {
            samples_per_chunk,
            buffer: Vec::with_capacity(samples_per_chunk),
        }
    }

    /// Append samples and return every chunk completed by them
    pub fn push(&mut self, samples: &[i16]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut rest = samples;
        while !rest.is_empty() {
            let room = self.samples_per_chunk - self.buffer.len();
            let take = room.min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.buffer.len() == self.samples_per_chunk {
                chunks.push(encode(&self.buffer));
                self.buffer.clear();
            }
        }
        chunks
    }

    /// Drop a partially filled chunk
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn encode(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emits_only_full_chunks() {
        let mut chunker = AudioChunker::new(1600);
        assert!(chunker.push(&[1i16; 1000]).is_empty());
        assert_eq!(chunker.buffered(), 1000);

        let chunks = chunker.push(&[1i16; 2500]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunker.buffered(), 300);

        let decoded = STANDARD.decode(&chunks[0]).unwrap();
        assert_eq!(decoded.len(), 3200);
    }

    #[test]
    fn test_little_endian_encoding() {
        let mut chunker = AudioChunker::new(2);
        let chunks = chunker.push(&[0x0102, -1]);
        let decoded = STANDARD.decode(&chunks[0]).unwrap();
        assert_eq!(decoded, vec![0x02, 0x01, 0xff, 0xff]);
    }

    #[test]
    fn test_clear_drops_partial_chunk() {
        let mut chunker = AudioChunker::new(4);
        chunker.push(&[1, 2, 3]);
        chunker.clear();
        assert_eq!(chunker.push(&[4, 5, 6, 7]).len(), 1);
        assert_eq!(chunker.buffered(), 0);
    }
}
