//! MySQL primitive encoders on top of [`bytes::BufMut`].

use bytes::BufMut;

/// Number of bytes `put_lenenc_int` uses for `value`.
pub fn lenenc_int_size(value: u64) -> usize {
    if value < 251 {
        1
    } else if value < 0x1_0000 {
        3
    } else if value < 0x100_0000 {
        4
    } else {
        9
    }
}

/// Number of bytes `put_lenenc_bytes` uses for `data`.
pub fn lenenc_bytes_size(data: &[u8]) -> usize {
    lenenc_int_size(data.len() as u64) + data.len()
}

/// MySQL encodings for any [`BufMut`].
pub trait MySqlBufMut: BufMut {
    fn put_u24_le(&mut self, value: u32) {
        self.put_uint_le(u64::from(value & 0xFF_FF_FF), 3);
    }

    fn put_lenenc_int(&mut self, value: u64) {
        if value < 251 {
            self.put_u8(value as u8);
        } else if value < 0x1_0000 {
            self.put_u8(0xFC);
            self.put_u16_le(value as u16);
        } else if value < 0x100_0000 {
            self.put_u8(0xFD);
            self.put_u24_le(value as u32);
        } else {
            self.put_u8(0xFE);
            self.put_u64_le(value);
        }
    }

    fn put_lenenc_bytes(&mut self, data: &[u8]) {
        self.put_lenenc_int(data.len() as u64);
        self.put_slice(data);
    }

    fn put_null_string(&mut self, data: &[u8]) {
        self.put_slice(data);
        self.put_u8(0);
    }
}

impl<B: BufMut> MySqlBufMut for B {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parser::PacketReader;
    use bytes::BytesMut;

    #[test]
    fn test_lenenc_sizes_match_output() {
        for value in [0u64, 250, 251, 0xFFFF, 0x1_0000, 0xFF_FFFF, 0x100_0000] {
            let mut buf = BytesMut::new();
            buf.put_lenenc_int(value);
            assert_eq!(buf.len(), lenenc_int_size(value), "value {}", value);

            let mut reader = PacketReader::new(&buf);
            assert_eq!(reader.read_lenenc_int("v").unwrap(), Some(value));
        }
    }

    #[test]
    fn test_put_u24() {
        let mut buf = BytesMut::new();
        buf.put_u24_le(0x0012_3456);
        assert_eq!(&buf[..], &[0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_null_string() {
        let mut buf = BytesMut::new();
        buf.put_null_string(b"test");
        assert_eq!(&buf[..], b"test\0");
    }
}
