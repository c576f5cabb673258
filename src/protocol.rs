/// Service ↔ client wire formats.
///
/// Every non-bootstrap transport message is an authenticated envelope
/// (all integers little-endian):
/// ```text
/// ┌──────────┬──────────┬──────────┬────────────────┐
/// │ Byte 0-3 │ Byte 4-15│ Byte16-31│ Byte 32..N     │
/// │ Seq Num  │ IV       │ MAC      │ Ciphertext     │
/// │ (u32 LE) │ (12 B)   │ (16 B)   │                │
/// └──────────┴──────────┴──────────┴────────────────┘
/// ```
/// The plaintext inside the ciphertext starts with a second copy of the
/// sequence number; the crypto layer rejects frames where the two differ.
///
/// Decrypted speaker and microphone payloads are built from binary chunks:
/// ```text
/// ┌──────────┬────────┬────────┬──────────┬──────────────┐
/// │ Byte 0-3 │ Byte 4 │ Byte 5 │ Byte 6-7 │ Byte 8..     │
/// │ Length   │ Type   │ Count  │ Reserved │ Data[Length] │
/// │ (u32 LE) │ (u8)   │ (u8)   │ (u16 LE) │              │
/// └──────────┴────────┴────────┴──────────┴──────────────┘
/// ```
/// Type 0 data is `offset:u64 LE` followed by `count + 1` back-to-back
/// OPUS frames; any other type carries a 4-byte marker echoed back to the
/// service.

// ═══════════════════════════════════════════════════════════════════════
//  Constants
// ═══════════════════════════════════════════════════════════════════════

/// Size of the sequence number prefix, outer and inner.
pub const SEQUENCE_SIZE: usize = 4;

/// Size of the AES-GCM initialization vector.
pub const IV_SIZE: usize = 12;

/// Size of the GCM authentication tag.
pub const MAC_SIZE: usize = 16;

/// Envelope header: outer sequence + IV + MAC.
pub const ENVELOPE_HEADER_SIZE: usize = SEQUENCE_SIZE + IV_SIZE + MAC_SIZE;

/// Binary chunk header: length + type + count + reserved.
pub const CHUNK_HEADER_SIZE: usize = 8;

/// Size of the stream offset carried by audio chunks.
pub const OFFSET_SIZE: usize = 8;

/// Chunk type for audio data.
pub const CHUNK_TYPE_AUDIO: u8 = 0;

// ═══════════════════════════════════════════════════════════════════════
//  Binary chunks
// ═══════════════════════════════════════════════════════════════════════

/// One parsed binary chunk of a decrypted speaker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk<'a> {
    /// OPUS audio: absolute stream offset plus `frames` concatenated
    /// compressed frames (`count + 1` of them).
    Audio { offset: u64, frames: u8, data: &'a [u8] },
    /// Service marker to be echoed back.
    Marker(u32),
}

/// Iterator over the chunks of a speaker message body (the decrypted
/// plaintext after the inner sequence number).
///
/// Stops at the first malformed chunk; the caller decides whether the
/// message was fully consumed via [`ChunkReader::finished`].
pub struct ChunkReader<'a> {
    rest: &'a [u8],
}

impl<'a> ChunkReader<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        ChunkReader { rest: body }
    }

    /// `true` when every byte of the message was consumed cleanly.
    pub fn finished(&self) -> bool {
        self.rest.is_empty()
    }
}

impl<'a> Iterator for ChunkReader<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Chunk<'a>> {
        if self.rest.len() < CHUNK_HEADER_SIZE {
            return None;
        }

        let length = read_u32_le(&self.rest[0..4]) as usize;
        let chunk_type = self.rest[4];
        let count = self.rest[5];
        // Bytes 6-7 are reserved.

        if self.rest.len() < CHUNK_HEADER_SIZE + length {
            return None;
        }
        let data = &self.rest[CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + length];
        self.rest = &self.rest[CHUNK_HEADER_SIZE + length..];

        if chunk_type == CHUNK_TYPE_AUDIO {
            if data.len() < OFFSET_SIZE {
                return None;
            }
            Some(Chunk::Audio {
                offset: read_u64_le_unaligned(&data[0..OFFSET_SIZE]),
                frames: count,
                data: &data[OFFSET_SIZE..],
            })
        } else {
            if data.len() < 4 {
                return None;
            }
            Some(Chunk::Marker(read_u32_le(&data[0..4])))
        }
    }
}

/// Build a microphone audio chunk: header, stream offset, raw PCM.
///
/// The chunk length field covers the offset and the PCM bytes.
pub fn build_microphone_chunk(offset: u64, pcm: &[u8]) -> Vec<u8> {
    let length = (pcm.len() + OFFSET_SIZE) as u32;
    let mut buf = Vec::with_capacity(CHUNK_HEADER_SIZE + pcm.len() + OFFSET_SIZE);
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(CHUNK_TYPE_AUDIO);
    buf.push(0); // count
    buf.extend_from_slice(&0u16.to_le_bytes()); // reserved
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(pcm);
    buf
}

// ═══════════════════════════════════════════════════════════════════════
//  Little-endian helpers
// ═══════════════════════════════════════════════════════════════════════

pub fn read_u32_le(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Read a 64-bit offset as two 32-bit halves. Offsets land on unaligned
/// boundaries inside audio chunks, so never reinterpret the bytes in place.
pub fn read_u64_le_unaligned(buf: &[u8]) -> u64 {
    let lo = read_u32_le(&buf[0..4]) as u64;
    let hi = read_u32_le(&buf[4..8]) as u64;
    lo | (hi << 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_chunk(offset: u64, frames: u8, opus: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((opus.len() + OFFSET_SIZE) as u32).to_le_bytes());
        buf.push(CHUNK_TYPE_AUDIO);
        buf.push(frames);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(opus);
        buf
    }

    fn marker_chunk(marker: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.push(1);
        buf.push(0);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&marker.to_le_bytes());
        buf
    }

    #[test]
    fn parses_audio_then_marker() {
        let opus = [0xAAu8; 320];
        let mut body = audio_chunk(960, 1, &opus);
        body.extend_from_slice(&marker_chunk(7));

        let mut reader = ChunkReader::new(&body);
        match reader.next().unwrap() {
            Chunk::Audio { offset, frames, data } => {
                assert_eq!(offset, 960);
                assert_eq!(frames, 1);
                assert_eq!(data, &opus[..]);
            }
            other => panic!("expected audio chunk, got {other:?}"),
        }
        assert_eq!(reader.next().unwrap(), Chunk::Marker(7));
        assert!(reader.next().is_none());
        assert!(reader.finished());
    }

    #[test]
    fn offset_survives_unaligned_position() {
        // A marker chunk first shifts the audio chunk's offset field onto
        // an odd byte boundary.
        let mut body = marker_chunk(1);
        body.extend_from_slice(&audio_chunk(0x1_0000_0001, 0, &[0u8; 160]));

        let chunks: Vec<_> = ChunkReader::new(&body).collect();
        assert_eq!(chunks.len(), 2);
        match &chunks[1] {
            Chunk::Audio { offset, .. } => assert_eq!(*offset, 0x1_0000_0001),
            other => panic!("expected audio chunk, got {other:?}"),
        }
    }

    #[test]
    fn truncated_chunk_stops_iteration() {
        let mut body = audio_chunk(0, 0, &[0u8; 160]);
        body.extend_from_slice(&[9, 0, 0]); // not even a full header

        let mut reader = ChunkReader::new(&body);
        assert!(reader.next().is_some());
        assert!(reader.next().is_none());
        assert!(!reader.finished());
    }

    #[test]
    fn chunk_length_overrunning_buffer_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1000u32.to_le_bytes());
        buf.push(CHUNK_TYPE_AUDIO);
        buf.push(0);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&[0u8; 16]); // far less than the claimed 1000

        assert!(ChunkReader::new(&buf).next().is_none());
    }

    #[test]
    fn microphone_chunk_round_trips() {
        let pcm = [0x42u8; 640];
        let chunk = build_microphone_chunk(1280, &pcm);
        assert_eq!(chunk.len(), CHUNK_HEADER_SIZE + OFFSET_SIZE + pcm.len());
        assert_eq!(read_u32_le(&chunk[0..4]) as usize, pcm.len() + OFFSET_SIZE);

        match ChunkReader::new(&chunk).next().unwrap() {
            Chunk::Audio { offset, frames, data } => {
                assert_eq!(offset, 1280);
                assert_eq!(frames, 0);
                assert_eq!(data, &pcm[..]);
            }
            other => panic!("expected audio chunk, got {other:?}"),
        }
    }

    #[test]
    fn u64_halves_recombine() {
        let bytes = 0xDEAD_BEEF_0102_0304u64.to_le_bytes();
        assert_eq!(read_u64_le_unaligned(&bytes), 0xDEAD_BEEF_0102_0304);
    }
}
