//! Variable-width binary primitives.
//!
//! The layout is byte-compatible with the `lib0` encoding used by Yjs
//! providers, so frames produced here can be read by any peer speaking the
//! y-webrtc family of protocols:
//!
//! - unsigned integers are written 7 bits at a time, least significant group
//!   first, with the high bit set on every byte except the last;
//! - byte arrays and strings are prefixed with their length as a varuint.

use crate::FrameError;

/// Longest varuint that still fits in a `u64` (ceil(64 / 7)).
const MAX_VARUINT_LEN: usize = 10;

/// Append-only writer for frame payloads.
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an encoder with preallocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Write a single raw byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write an unsigned integer in variable-width form.
    pub fn write_var_uint(&mut self, mut value: u64) {
        while value > 0x7f {
            self.buf.push(0x80 | (value & 0x7f) as u8);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    /// Write a length-prefixed byte array.
    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_var_uint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_var_string(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the encoder and return the written bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-style reader over an encoded buffer.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Start reading at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True once every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Read a single raw byte.
    pub fn read_u8(&mut self) -> Result<u8, FrameError> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| FrameError::unexpected_end("u8"))?;
        self.pos += 1;
        Ok(byte)
    }

    /// Read a variable-width unsigned integer.
    pub fn read_var_uint(&mut self) -> Result<u64, FrameError> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARUINT_LEN {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| FrameError::unexpected_end("varuint"))?;
            self.pos += 1;

            let bits = (byte & 0x7f) as u64;
            let shift = 7 * i as u32;
            // The tenth byte may only carry the single remaining bit.
            if i == MAX_VARUINT_LEN - 1 && bits > 1 {
                return Err(FrameError::Malformed("varuint overflows u64".into()));
            }
            value |= bits << shift;

            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(FrameError::Malformed("varuint longer than 10 bytes".into()))
    }

    /// Read a length-prefixed byte array, borrowing from the input.
    pub fn read_var_bytes(&mut self) -> Result<&'a [u8], FrameError> {
        let len = self.read_var_uint()?;
        let len = usize::try_from(len)
            .map_err(|_| FrameError::Malformed(format!("length {len} does not fit in memory")))?;
        if len > self.remaining() {
            return Err(FrameError::Malformed(format!(
                "length prefix {len} exceeds remaining {} bytes",
                self.remaining()
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_var_string(&mut self) -> Result<&'a str, FrameError> {
        let bytes = self.read_var_bytes()?;
        std::str::from_utf8(bytes).map_err(|e| FrameError::Malformed(format!("invalid utf-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_values_take_one_byte() {
        let mut enc = Encoder::new();
        enc.write_var_uint(0);
        enc.write_var_uint(127);
        assert_eq!(enc.into_bytes(), vec![0x00, 0x7f]);
    }

    #[test]
    fn varuint_matches_lib0_layout() {
        let mut enc = Encoder::new();
        enc.write_var_uint(128);
        enc.write_var_uint(300);
        // 128 = 0b1_0000000 -> [0x80, 0x01]; 300 = 0b10_0101100 -> [0xac, 0x02]
        assert_eq!(enc.into_bytes(), vec![0x80, 0x01, 0xac, 0x02]);
    }

    #[test]
    fn varuint_extremes_decode() {
        for value in [0u64, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut enc = Encoder::new();
            enc.write_var_uint(value);
            let bytes = enc.into_bytes();
            let mut dec = Decoder::new(&bytes);
            assert_eq!(dec.read_var_uint().unwrap(), value);
            assert!(dec.is_empty());
        }
    }

    #[test]
    fn truncated_varuint_is_malformed() {
        let mut dec = Decoder::new(&[0x80, 0x80]);
        assert!(matches!(dec.read_var_uint(), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn overlong_varuint_is_malformed() {
        let bytes = [0xff; 11];
        let mut dec = Decoder::new(&bytes);
        assert!(matches!(dec.read_var_uint(), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn var_bytes_are_length_prefixed() {
        let mut enc = Encoder::new();
        enc.write_var_bytes(b"abc");
        enc.write_var_string("é");
        let bytes = enc.into_bytes();
        assert_eq!(&bytes[..4], &[3, b'a', b'b', b'c']);

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_var_bytes().unwrap(), b"abc");
        assert_eq!(dec.read_var_string().unwrap(), "é");
    }

    #[test]
    fn length_prefix_past_end_is_malformed() {
        // Claims 5 bytes, carries 2.
        let mut dec = Decoder::new(&[5, 1, 2]);
        assert!(matches!(dec.read_var_bytes(), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let mut dec = Decoder::new(&[2, 0xc3, 0x28]);
        assert!(matches!(dec.read_var_string(), Err(FrameError::Malformed(_))));
    }
}
