//! Frame codec for file transfers.
//!
//! File contents move in frames of at most `buffer_size` wire bytes. Boards
//! that expose `sys.stdin.buffer` take raw binary frames; all others take
//! lowercase hex, two wire bytes per data byte. One [`ACK`](crate::ACK) is
//! exchanged per frame as flow control.

/// Smallest usable frame size (one hex-encoded byte).
pub const MIN_BUFFER_SIZE: usize = 2;

/// Errors raised while decoding received frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum FrameError {
    /// A hex frame held invalid characters or an odd length.
    #[error("malformed hex frame: {0}")]
    Hex(String),
}

/// Frame sizing and encoding for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    binary: bool,
    buffer_size: usize,
}

impl FrameCodec {
    /// Creates a codec; `buffer_size` is clamped to an even value ≥ 2.
    pub fn new(binary: bool, buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(MIN_BUFFER_SIZE) & !1;
        Self {
            binary,
            buffer_size,
        }
    }

    /// Whether frames are raw binary.
    pub const fn is_binary(&self) -> bool {
        self.binary
    }

    /// Maximum wire bytes per frame.
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of wire bytes needed to carry `len` data bytes.
    pub const fn wire_len(&self, len: usize) -> usize {
        if self.binary { len } else { len * 2 }
    }

    /// Data bytes carried by one full frame.
    pub const fn data_per_frame(&self) -> usize {
        if self.binary {
            self.buffer_size
        } else {
            self.buffer_size / 2
        }
    }

    /// Wire length of the next frame when `wire_remaining` bytes are left.
    pub fn next_frame_len(&self, wire_remaining: usize) -> usize {
        wire_remaining.min(self.buffer_size)
    }

    /// Splits `data` into encoded frames, in order.
    pub fn frames<'a>(&self, data: &'a [u8]) -> impl Iterator<Item = Vec<u8>> + 'a {
        let codec = *self;
        data.chunks(self.data_per_frame())
            .map(move |chunk| codec.encode(chunk))
    }

    /// Encodes one frame of data bytes.
    pub fn encode(&self, chunk: &[u8]) -> Vec<u8> {
        if self.binary {
            chunk.to_vec()
        } else {
            hex::encode(chunk).into_bytes()
        }
    }

    /// Decodes one received frame back into data bytes.
    pub fn decode(&self, frame: &[u8]) -> Result<Vec<u8>, FrameError> {
        if self.binary {
            Ok(frame.to_vec())
        } else {
            hex::decode(frame).map_err(|e| FrameError::Hex(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_frames_fit_the_buffer() {
        let codec = FrameCodec::new(false, 8);
        let frames: Vec<_> = codec.frames(b"abcdefghij").collect();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() <= 8));
        assert_eq!(frames[0], b"61626364");
        assert_eq!(frames[2], b"696a");
        assert_eq!(codec.wire_len(10), 20);
    }

    #[test]
    fn binary_frames_are_verbatim() {
        let codec = FrameCodec::new(true, 4);
        let frames: Vec<_> = codec.frames(&[0, 3, 4, 6, 0xff]).collect();
        assert_eq!(frames, vec![vec![0, 3, 4, 6], vec![0xff]]);
        assert_eq!(codec.decode(&frames[1]).unwrap(), vec![0xff]);
    }

    #[test]
    fn buffer_size_is_clamped_even() {
        assert_eq!(FrameCodec::new(false, 0).buffer_size(), 2);
        assert_eq!(FrameCodec::new(false, 129).buffer_size(), 128);
        assert_eq!(FrameCodec::new(true, 7).next_frame_len(100), 6);
    }

    #[test]
    fn rejects_bad_hex() {
        let codec = FrameCodec::new(false, 16);
        assert!(codec.decode(b"zz").is_err());
        assert!(codec.decode(b"abc").is_err());
    }
}
