use bytes::{BufMut, Bytes};
use ethereum_types::{H128, H256, H512, H520};
use tinyvec::ArrayVec;

use super::constants::{RLP_NULL, RLP_SHORT_LEN_LIMIT};

/// Function for encoding a value to RLP.
/// For encoding the value into a buffer directly, use [`RLPEncode::encode`].
pub fn encode<T: RLPEncode>(value: T) -> Vec<u8> {
    let mut buf = Vec::new();
    value.encode(&mut buf);
    buf
}

pub trait RLPEncode {
    fn encode(&self, buf: &mut dyn BufMut);

    fn length(&self) -> usize {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf.len()
    }

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// Emits the minimal big-endian form of an unsigned integer, prefixed as a blob.
/// Zero is the empty blob (`0x80`), values below `0x80` are their own encoding.
fn encode_unsigned(be_bytes: &[u8], buf: &mut dyn BufMut) {
    match be_bytes.iter().position(|&x| x != 0) {
        None => buf.put_u8(RLP_NULL),
        Some(start) => {
            let trimmed = &be_bytes[start..];
            if trimmed.len() == 1 && trimmed[0] < RLP_NULL {
                buf.put_u8(trimmed[0]);
            } else {
                buf.put_u8(RLP_NULL + trimmed.len() as u8);
                buf.put_slice(trimmed);
            }
        }
    }
}

impl RLPEncode for bool {
    #[inline(always)]
    fn encode(&self, buf: &mut dyn BufMut) {
        if *self {
            buf.put_u8(0x01);
        } else {
            buf.put_u8(RLP_NULL);
        }
    }

    #[inline(always)]
    fn length(&self) -> usize {
        1
    }
}

impl RLPEncode for u8 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned(&self.to_be_bytes(), buf)
    }
}

impl RLPEncode for u16 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned(&self.to_be_bytes(), buf)
    }
}

impl RLPEncode for u32 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned(&self.to_be_bytes(), buf)
    }
}

impl RLPEncode for u64 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned(&self.to_be_bytes(), buf)
    }
}

impl RLPEncode for usize {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned(&self.to_be_bytes(), buf)
    }
}

impl RLPEncode for () {
    fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_u8(RLP_NULL);
    }
}

impl RLPEncode for [u8] {
    #[inline(always)]
    fn encode(&self, buf: &mut dyn BufMut) {
        if self.len() == 1 && self[0] < RLP_NULL {
            buf.put_u8(self[0]);
        } else {
            let len = self.len();
            if len < RLP_SHORT_LEN_LIMIT {
                buf.put_u8(RLP_NULL + len as u8);
            } else {
                let mut bytes = ArrayVec::<[u8; 8]>::new();
                bytes.extend_from_slice(&len.to_be_bytes());
                let start = bytes.iter().position(|&x| x != 0).unwrap_or(7);
                let len_len = bytes.len() - start;
                buf.put_u8(0xb7 + len_len as u8);
                buf.put_slice(&bytes[start..]);
            }
            buf.put_slice(self);
        }
    }
}

impl<const N: usize> RLPEncode for [u8; N] {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_ref().encode(buf)
    }
}

impl RLPEncode for str {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

impl RLPEncode for &str {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

impl RLPEncode for String {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

impl RLPEncode for Bytes {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_ref().encode(buf)
    }
}

impl<T: RLPEncode> RLPEncode for Vec<T> {
    fn encode(&self, buf: &mut dyn BufMut) {
        if self.is_empty() {
            buf.put_u8(0xc0);
        } else {
            let mut total_len = 0;
            for item in self {
                total_len += item.length();
            }
            encode_length(total_len, buf);
            for item in self {
                item.encode(buf);
            }
        }
    }
}

/// Writes the list prefix for a payload of `total_len` bytes.
pub(crate) fn encode_length(total_len: usize, buf: &mut dyn BufMut) {
    if total_len < RLP_SHORT_LEN_LIMIT {
        buf.put_u8(0xc0 + total_len as u8);
    } else {
        let mut bytes = ArrayVec::<[u8; 8]>::new();
        bytes.extend_from_slice(&total_len.to_be_bytes());
        let start = bytes.iter().position(|&x| x != 0).unwrap_or(7);
        let len_len = bytes.len() - start;
        buf.put_u8(0xf7 + len_len as u8);
        buf.put_slice(&bytes[start..]);
    }
}

impl<S: RLPEncode, T: RLPEncode> RLPEncode for (S, T) {
    fn encode(&self, buf: &mut dyn BufMut) {
        let total_len = self.0.length() + self.1.length();
        encode_length(total_len, buf);
        self.0.encode(buf);
        self.1.encode(buf);
    }
}

impl<S: RLPEncode, T: RLPEncode, U: RLPEncode> RLPEncode for (S, T, U) {
    fn encode(&self, buf: &mut dyn BufMut) {
        let total_len = self.0.length() + self.1.length() + self.2.length();
        encode_length(total_len, buf);
        self.0.encode(buf);
        self.1.encode(buf);
        self.2.encode(buf);
    }
}

impl RLPEncode for H128 {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

impl RLPEncode for H256 {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

impl RLPEncode for H512 {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

impl RLPEncode for H520 {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

/// Encodes a float through its IEEE-754 bit pattern, as a u64 blob.
/// Non-standard wire format kept for compatibility; deliberately not part
/// of [`RLPEncode`] so no generic numeric path can reach it.
pub fn encode_f64_bits(value: f64, buf: &mut dyn BufMut) {
    value.to_bits().encode(buf)
}

#[cfg(test)]
mod tests {
    use super::{encode_f64_bits, RLPEncode};
    use crate::constants::{RLP_EMPTY_LIST, RLP_NULL};

    #[test]
    fn can_encode_booleans() {
        let mut encoded = Vec::new();
        true.encode(&mut encoded);
        assert_eq!(encoded, vec![0x01]);

        let mut encoded = Vec::new();
        false.encode(&mut encoded);
        assert_eq!(encoded, vec![RLP_NULL]);
    }

    #[test]
    fn can_encode_integers() {
        assert_eq!(0u64.encode_to_vec(), vec![RLP_NULL]);
        assert_eq!(15u64.encode_to_vec(), vec![0x0f]);
        assert_eq!(0x7fu64.encode_to_vec(), vec![0x7f]);
        assert_eq!(0x80u64.encode_to_vec(), vec![RLP_NULL + 1, 0x80]);
        assert_eq!(1024u64.encode_to_vec(), vec![0x82, 0x04, 0x00]);
        assert_eq!(
            u64::MAX.encode_to_vec(),
            vec![0x88, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn can_encode_bytes() {
        let message: [u8; 1] = [0x00];
        assert_eq!(message.encode_to_vec(), vec![0x00]);

        let message: [u8; 1] = [0x0f];
        assert_eq!(message.encode_to_vec(), vec![0x0f]);

        let message: [u8; 2] = [0x04, 0x00];
        assert_eq!(message.encode_to_vec(), vec![RLP_NULL + 2, 0x04, 0x00]);
    }

    #[test]
    fn can_encode_long_blobs() {
        let message = vec![0xaa_u8; 56];
        let encoded = message.as_slice().encode_to_vec();
        assert_eq!(&encoded[..2], &[0xb8, 56]);
        assert_eq!(&encoded[2..], &message[..]);

        let message = vec![0xbb_u8; 1000];
        let encoded = message.as_slice().encode_to_vec();
        assert_eq!(&encoded[..3], &[0xb9, 0x03, 0xe8]);
        assert_eq!(&encoded[3..], &message[..]);
    }

    #[test]
    fn can_encode_strings() {
        assert_eq!("dog".encode_to_vec(), vec![RLP_NULL + 3, b'd', b'o', b'g']);
        assert_eq!("".encode_to_vec(), vec![RLP_NULL]);
    }

    #[test]
    fn can_encode_lists_of_str() {
        // encode ["cat", "dog"]
        let message = vec!["cat", "dog"];
        let expected: [u8; 9] = [0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g'];
        assert_eq!(message.encode_to_vec(), expected);

        // encode empty list
        let message: Vec<&str> = vec![];
        assert_eq!(message.encode_to_vec(), vec![RLP_EMPTY_LIST]);
    }

    #[test]
    fn can_encode_tuple() {
        let tuple: (u8, u8) = (0x01, 0x02);
        assert_eq!(tuple.encode_to_vec(), vec![0xc0 + 2, 0x01, 0x02]);
    }

    #[test]
    fn can_encode_fixed_hashes() {
        use hex_literal::hex;

        let hash = ethereum_types::H128(hex!("ef2d6d194084c2de36e0dabfce45d046"));
        let expected = hex!("90ef2d6d194084c2de36e0dabfce45d046");
        assert_eq!(hash.encode_to_vec(), expected);
    }

    #[test]
    fn float_bit_pattern_is_the_u64_encoding() {
        let mut encoded = Vec::new();
        encode_f64_bits(1.5f64, &mut encoded);

        let mut expected = Vec::new();
        1.5f64.to_bits().encode(&mut expected);
        assert_eq!(encoded, expected);

        // zero is all-zero bits, hence the empty blob
        let mut encoded = Vec::new();
        encode_f64_bits(0.0f64, &mut encoded);
        assert_eq!(encoded, vec![RLP_NULL]);
    }
}
