use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Size in bytes of an encoded [`FrameHeader`] on the wire.
pub const HEADER_LEN: usize = 7 * 8 + 8 * 8;

/// Per-frame capture metadata.
///
/// Written once by the frame sink and never modified afterwards. On the
/// frame channel it is encoded as seven little-endian `u64` fields followed by
/// eight little-endian `f64` fields, in declaration order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub width: u64,
    pub height: u64,
    /// Bytes of pixel data actually carried by the frame
    pub image_size: u64,
    /// Size of the payload that follows the header on the wire (`width * height`)
    pub buffer_size: u64,
    /// Capture timestamp in hardware clock ticks
    pub timestamp: u64,
    /// Monotonically increasing sequence id assigned by the backend
    pub frame_id: u64,
    pub logging: bool,
    pub gain: f64,
    pub gain_min: f64,
    pub gain_max: f64,
    pub exposure: f64,
    pub exposure_min: f64,
    pub exposure_max: f64,
    /// Configured acquisition rate (Hz)
    pub rate: f64,
    /// Rate measured at the frame sink (Hz)
    pub rate_measured: f64,
}

impl FrameHeader {
    /// Header for a `width` x `height` 8-bit frame carrying a full payload.
    pub fn new(width: u32, height: u32, frame_id: u64, timestamp: u64) -> Self {
        let size = width as u64 * height as u64;
        Self {
            width: width as u64,
            height: height as u64,
            image_size: size,
            buffer_size: size,
            timestamp,
            frame_id,
            ..Default::default()
        }
    }

    pub fn pixel_count(&self) -> usize {
        (self.width * self.height) as usize
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.width);
        buf.put_u64_le(self.height);
        buf.put_u64_le(self.image_size);
        buf.put_u64_le(self.buffer_size);
        buf.put_u64_le(self.timestamp);
        buf.put_u64_le(self.frame_id);
        buf.put_u64_le(self.logging as u64);
        buf.put_f64_le(self.gain);
        buf.put_f64_le(self.gain_min);
        buf.put_f64_le(self.gain_max);
        buf.put_f64_le(self.exposure);
        buf.put_f64_le(self.exposure_min);
        buf.put_f64_le(self.exposure_max);
        buf.put_f64_le(self.rate);
        buf.put_f64_le(self.rate_measured);
    }

    /// Decode a header from the first [`HEADER_LEN`] bytes of `buf`.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }

        Some(Self {
            width: buf.get_u64_le(),
            height: buf.get_u64_le(),
            image_size: buf.get_u64_le(),
            buffer_size: buf.get_u64_le(),
            timestamp: buf.get_u64_le(),
            frame_id: buf.get_u64_le(),
            logging: buf.get_u64_le() != 0,
            gain: buf.get_f64_le(),
            gain_min: buf.get_f64_le(),
            gain_max: buf.get_f64_le(),
            exposure: buf.get_f64_le(),
            exposure_min: buf.get_f64_le(),
            exposure_max: buf.get_f64_le(),
            rate: buf.get_f64_le(),
            rate_measured: buf.get_f64_le(),
        })
    }
}

/// A frame copied out of the ring buffer.
///
/// `data` always holds `header.buffer_size` bytes; only the first
/// `header.image_size` of them were written by the capture backend.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub data: Bytes,
}

impl Frame {
    pub fn sequence(&self) -> u64 {
        self.header.frame_id
    }

    /// Serialize as `header || payload` into `out`, replacing its contents.
    pub fn write_wire(&self, out: &mut BytesMut) {
        out.clear();
        out.reserve(HEADER_LEN + self.data.len());
        self.header.encode(out);
        out.extend_from_slice(&self.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut header = FrameHeader::new(4, 2, 77, 123_456);
        header.logging = true;
        header.gain = 12.5;
        header.rate_measured = 29.97;

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(HEADER_LEN, 120);

        // width is the first field, frame id the sixth
        assert_eq!(&buf[0..8], &4u64.to_le_bytes());
        assert_eq!(&buf[40..48], &77u64.to_le_bytes());
        assert_eq!(&buf[48..56], &1u64.to_le_bytes());
        assert_eq!(&buf[56..64], &12.5f64.to_le_bytes());

        assert_eq!(FrameHeader::decode(&buf), Some(header));
    }

    #[test]
    fn test_wire_frame() {
        let frame = Frame {
            header: FrameHeader::new(3, 3, 1, 0),
            data: Bytes::from(vec![9u8; 9]),
        };

        let mut out = BytesMut::from(&b"stale"[..]);
        frame.write_wire(&mut out);
        assert_eq!(out.len(), HEADER_LEN + 9);
        assert!(out[HEADER_LEN..].iter().all(|b| *b == 9));
    }

    #[test]
    fn test_decode_short_buffer() {
        assert!(FrameHeader::decode(&[0u8; HEADER_LEN - 1]).is_none());
    }
}
