use super::{
    constants::{RLP_EMPTY_LIST, RLP_NULL, RLP_SHORT_LEN_LIMIT},
    error::RLPDecodeError,
};
use bytes::{Bytes, BytesMut};
use ethereum_types::{H128, H256, H512, H520};

/// Trait for decoding RLP encoded slices of data.
/// See <https://ethereum.org/en/developers/docs/data-structures-and-encoding/rlp/#rlp-decoding> for more information.
/// Implementors need to implement the [`decode_unfinished`](RLPDecode::decode_unfinished)
/// method, which decodes one item and returns the remaining bytes; consumers use
/// [`decode`](RLPDecode::decode), which additionally rejects trailing input.
pub trait RLPDecode: Sized {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError>;

    fn decode(rlp: &[u8]) -> Result<Self, RLPDecodeError> {
        let (decoded, remaining) = Self::decode_unfinished(rlp)?;
        if !remaining.is_empty() {
            return Err(RLPDecodeError::InvalidLength);
        }

        Ok(decoded)
    }
}

impl RLPDecode for bool {
    #[inline(always)]
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        if buf.is_empty() {
            return Err(RLPDecodeError::InvalidLength);
        }
        let value = match buf[0] {
            RLP_NULL => false,
            0x01 => true,
            _ => return Err(RLPDecodeError::MalformedBoolean),
        };

        Ok((value, &buf[1..]))
    }
}

impl RLPDecode for u8 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let padded: [u8; 1] = static_left_pad(bytes)?;
        Ok((padded[0], rest))
    }
}

impl RLPDecode for u16 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let padded_bytes = static_left_pad(bytes)?;
        Ok((u16::from_be_bytes(padded_bytes), rest))
    }
}

impl RLPDecode for u32 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let padded_bytes = static_left_pad(bytes)?;
        Ok((u32::from_be_bytes(padded_bytes), rest))
    }
}

impl RLPDecode for u64 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let padded_bytes = static_left_pad(bytes)?;
        Ok((u64::from_be_bytes(padded_bytes), rest))
    }
}

impl RLPDecode for usize {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let padded_bytes = static_left_pad(bytes)?;
        Ok((usize::from_be_bytes(padded_bytes), rest))
    }
}

// Decodes a blob of a fixed size. Lists of same-typed elements decode through
// the Vec<T> implementation instead.
impl<const N: usize> RLPDecode for [u8; N] {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (decoded_bytes, rest) = decode_bytes(rlp)?;
        let value = decoded_bytes
            .try_into()
            .map_err(|_| RLPDecodeError::InvalidLength)?;

        Ok((value, rest))
    }
}

impl RLPDecode for Bytes {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (decoded, rest) = decode_bytes(rlp)?;
        Ok((Bytes::copy_from_slice(decoded), rest))
    }
}

impl RLPDecode for BytesMut {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (decoded, rest) = decode_bytes(rlp)?;
        Ok((BytesMut::from(decoded), rest))
    }
}

impl RLPDecode for H128 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest) = RLPDecode::decode_unfinished(rlp)?;
        Ok((H128(value), rest))
    }
}

impl RLPDecode for H256 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest) = RLPDecode::decode_unfinished(rlp)?;
        Ok((H256(value), rest))
    }
}

impl RLPDecode for H512 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest) = RLPDecode::decode_unfinished(rlp)?;
        Ok((H512(value), rest))
    }
}

impl RLPDecode for H520 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (value, rest) = RLPDecode::decode_unfinished(rlp)?;
        Ok((H520(value), rest))
    }
}

impl RLPDecode for String {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (str_bytes, rest) = decode_bytes(rlp)?;
        let value =
            String::from_utf8(str_bytes.to_vec()).map_err(|_| RLPDecodeError::MalformedData)?;
        Ok((value, rest))
    }
}

// A Vec<T> is a list of same-typed elements. Byte blobs decode through the
// [u8; N] implementation or similar (Bytes, BytesMut).
impl<T: RLPDecode> RLPDecode for Vec<T> {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        if rlp.is_empty() {
            return Err(RLPDecodeError::InvalidLength);
        }

        if rlp[0] == RLP_EMPTY_LIST {
            return Ok((Vec::new(), &rlp[1..]));
        }

        let (is_list, payload, input_rest) = decode_rlp_item(rlp)?;
        if !is_list {
            return Err(RLPDecodeError::UnexpectedString);
        }

        let mut result = Vec::new();
        let mut current_slice = payload;

        while !current_slice.is_empty() {
            let (item, rest_current_list) = T::decode_unfinished(current_slice)?;
            result.push(item);
            current_slice = rest_current_list;
        }

        Ok((result, input_rest))
    }
}

impl<T1: RLPDecode, T2: RLPDecode> RLPDecode for (T1, T2) {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        if rlp.is_empty() {
            return Err(RLPDecodeError::InvalidLength);
        }

        let (is_list, payload, input_rest) = decode_rlp_item(rlp)?;
        if !is_list {
            return Err(RLPDecodeError::UnexpectedString);
        }

        let (first, first_rest) = T1::decode_unfinished(payload)?;
        let (second, second_rest) = T2::decode_unfinished(first_rest)?;

        // check that there is no more data to parse after the second element.
        if !second_rest.is_empty() {
            return Err(RLPDecodeError::MalformedData);
        }

        Ok(((first, second), input_rest))
    }
}

impl<T1: RLPDecode, T2: RLPDecode, T3: RLPDecode> RLPDecode for (T1, T2, T3) {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        if rlp.is_empty() {
            return Err(RLPDecodeError::InvalidLength);
        }
        let (is_list, payload, input_rest) = decode_rlp_item(rlp)?;
        if !is_list {
            return Err(RLPDecodeError::UnexpectedString);
        }
        let (first, first_rest) = T1::decode_unfinished(payload)?;
        let (second, second_rest) = T2::decode_unfinished(first_rest)?;
        let (third, third_rest) = T3::decode_unfinished(second_rest)?;
        // check that there is no more data to decode after the third element.
        if !third_rest.is_empty() {
            return Err(RLPDecodeError::MalformedData);
        }

        Ok(((first, second, third), input_rest))
    }
}

/// Decodes an RLP item from a slice of bytes.
/// It returns a 3-element tuple with the following elements:
/// - A boolean indicating if the item is a list or not.
/// - The payload of the item, without its prefix.
/// - The remaining bytes after the item.
///
/// Only canonical encodings are accepted: a single byte below 0x80 must be
/// encoded as itself, and the long form may only carry lengths of 56 or more
/// with no leading zero bytes in the length.
pub fn decode_rlp_item(data: &[u8]) -> Result<(bool, &[u8], &[u8]), RLPDecodeError> {
    if data.is_empty() {
        return Err(RLPDecodeError::InvalidLength);
    }

    let first_byte = data[0];

    match first_byte {
        0..=0x7F => Ok((false, &data[..1], &data[1..])),
        0x80..=0xB7 => {
            let length = (first_byte - 0x80) as usize;
            if data.len() < length + 1 {
                return Err(RLPDecodeError::InvalidLength);
            }
            // a single byte below 0x80 must not carry a prefix
            if length == 1 && data[1] < 0x80 {
                return Err(RLPDecodeError::MalformedData);
            }
            Ok((false, &data[1..length + 1], &data[length + 1..]))
        }
        0xB8..=0xBF => {
            let length_of_length = (first_byte - 0xB7) as usize;
            if data.len() < length_of_length + 1 {
                return Err(RLPDecodeError::InvalidLength);
            }
            let length = decode_canonical_length(&data[1..length_of_length + 1])?;
            if data.len() < length_of_length + length + 1 {
                return Err(RLPDecodeError::InvalidLength);
            }
            Ok((
                false,
                &data[length_of_length + 1..length_of_length + length + 1],
                &data[length_of_length + length + 1..],
            ))
        }
        RLP_EMPTY_LIST..=0xF7 => {
            let length = (first_byte - RLP_EMPTY_LIST) as usize;
            if data.len() < length + 1 {
                return Err(RLPDecodeError::InvalidLength);
            }
            Ok((true, &data[1..length + 1], &data[length + 1..]))
        }
        0xF8..=0xFF => {
            let length_of_length = (first_byte - 0xF7) as usize;
            if data.len() < length_of_length + 1 {
                return Err(RLPDecodeError::InvalidLength);
            }
            let payload_length = decode_canonical_length(&data[1..length_of_length + 1])?;
            if data.len() < length_of_length + payload_length + 1 {
                return Err(RLPDecodeError::InvalidLength);
            }
            Ok((
                true,
                &data[length_of_length + 1..length_of_length + payload_length + 1],
                &data[length_of_length + payload_length + 1..],
            ))
        }
    }
}

/// Decodes a long-form length field. Rejects leading zero bytes and lengths
/// that would have fit the short form.
fn decode_canonical_length(length_bytes: &[u8]) -> Result<usize, RLPDecodeError> {
    let length = usize::from_be_bytes(static_left_pad(length_bytes)?);
    if length < RLP_SHORT_LEN_LIMIT {
        return Err(RLPDecodeError::MalformedData);
    }
    Ok(length)
}

/// Splits the input into the first RLP item (prefix included) and the
/// remaining bytes after it.
pub fn get_item_with_prefix(data: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let (_, payload, rest) = decode_rlp_item(data)?;
    let item_length = data.len() - rest.len();
    debug_assert!(payload.len() <= item_length);
    Ok((&data[..item_length], rest))
}

/// Decodes the payload of a blob item from a slice of bytes.
/// It returns a 2-element tuple with the following elements:
/// - The payload of the item.
/// - The remaining bytes after the item.
fn decode_bytes(data: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let (is_list, payload, rest) = decode_rlp_item(data)?;
    if is_list {
        return Err(RLPDecodeError::UnexpectedList);
    }
    Ok((payload, rest))
}

/// Pads a slice of bytes with zeros on the left to make it a fixed size slice.
/// The size of the data must be less than or equal to the size of the output array.
#[inline]
pub(crate) fn static_left_pad<const N: usize>(data: &[u8]) -> Result<[u8; N], RLPDecodeError> {
    let mut result = [0; N];

    if data.is_empty() {
        return Ok(result);
    }
    if data[0] == 0 {
        return Err(RLPDecodeError::MalformedData);
    }
    if data.len() > N {
        return Err(RLPDecodeError::InvalidLength);
    }
    result[N - data.len()..].copy_from_slice(data);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::RLPEncode;

    #[test]
    fn test_decode_bool() {
        let rlp = vec![0x01];
        let decoded = bool::decode(&rlp).unwrap();
        assert!(decoded);

        let rlp = vec![RLP_NULL];
        let decoded = bool::decode(&rlp).unwrap();
        assert!(!decoded);
    }

    #[test]
    fn test_decode_u64() {
        let rlp = vec![0x01];
        assert_eq!(u64::decode(&rlp).unwrap(), 1);

        let rlp = vec![RLP_NULL];
        assert_eq!(u64::decode(&rlp).unwrap(), 0);

        let rlp = vec![0x7f];
        assert_eq!(u64::decode(&rlp).unwrap(), 127);

        let rlp = vec![RLP_NULL + 1, RLP_NULL];
        assert_eq!(u64::decode(&rlp).unwrap(), 128);

        let rlp = vec![0x82, 0x04, 0x00];
        assert_eq!(u64::decode(&rlp).unwrap(), 1024);
    }

    #[test]
    fn test_decode_fixed_length_array() {
        let rlp = vec![0x0f];
        let decoded = <[u8; 1]>::decode(&rlp).unwrap();
        assert_eq!(decoded, [0x0f]);

        let rlp = vec![RLP_NULL + 3, 0x02, 0x03, 0x04];
        let decoded = <[u8; 3]>::decode(&rlp).unwrap();
        assert_eq!(decoded, [0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_decode_string() {
        let rlp = vec![RLP_NULL + 3, b'd', b'o', b'g'];
        let decoded = String::decode(&rlp).unwrap();
        assert_eq!(decoded, String::from("dog"));

        let rlp = vec![RLP_NULL];
        let decoded = String::decode(&rlp).unwrap();
        assert_eq!(decoded, String::from(""));
    }

    #[test]
    fn test_decode_lists() {
        // empty list
        let rlp = vec![RLP_EMPTY_LIST];
        let decoded: Vec<String> = Vec::decode(&rlp).unwrap();
        assert!(decoded.is_empty());

        // list with 3 numbers
        let rlp = vec![RLP_EMPTY_LIST + 3, 0x01, 0x02, 0x03];
        let decoded: Vec<u8> = Vec::decode(&rlp).unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);

        // list of strings
        let rlp = vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g'];
        let decoded: Vec<String> = Vec::decode(&rlp).unwrap();
        assert_eq!(decoded, vec!["cat".to_string(), "dog".to_string()]);
    }

    #[test]
    fn test_decode_list_of_lists() {
        let rlp = vec![
            RLP_EMPTY_LIST + 6,
            RLP_EMPTY_LIST + 2,
            0x01,
            0x02,
            RLP_EMPTY_LIST + 2,
            0x03,
            0x04,
        ];
        let decoded: Vec<Vec<u8>> = Vec::decode(&rlp).unwrap();
        assert_eq!(decoded, vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn test_decode_tuples() {
        let rlp = vec![RLP_EMPTY_LIST + 2, 0x01, 0x02];
        let decoded: (u8, u8) = <(u8, u8)>::decode(&rlp).unwrap();
        assert_eq!(decoded, (1, 2));

        let rlp = vec![RLP_EMPTY_LIST + 5, 0x01, 0x83, b'c', b'a', b't'];
        let decoded: (u8, String) = <(u8, String)>::decode(&rlp).unwrap();
        assert_eq!(decoded, (1, "cat".to_string()));
    }

    #[test]
    fn test_decode_list_as_string_fails() {
        // [1, 2, 3, 4] != 0x01020304
        let rlp = vec![RLP_EMPTY_LIST + 4, 0x01, 0x02, 0x03, 0x04];
        let decoded: Result<[u8; 4], _> = RLPDecode::decode(&rlp);
        assert!(decoded.is_err());

        let rlp = vec![RLP_EMPTY_LIST + 2, 0x01, 0x02];
        let decoded: Result<u16, _> = RLPDecode::decode(&rlp);
        assert!(decoded.is_err());
    }

    #[test]
    fn rejects_integers_with_leading_zeros() {
        let rlp = vec![RLP_NULL + 2, 0x00, 0x01];
        assert!(u64::decode(&rlp).is_err());

        let rlp = vec![RLP_NULL + 3, 0x00, 0xff, 0xff];
        assert!(u32::decode(&rlp).is_err());
    }

    #[test]
    fn rejects_non_minimal_single_byte() {
        // 0x05 must be encoded as itself, not as a one-byte blob
        let rlp = vec![RLP_NULL + 1, 0x05];
        assert!(u64::decode(&rlp).is_err());
        assert!(decode_rlp_item(&rlp).is_err());
    }

    #[test]
    fn rejects_short_lengths_in_long_form() {
        // a 3-byte blob length-prefixed with the long form
        let rlp = vec![0xb8, 0x03, 0x0a, 0x0b, 0x0c];
        assert!(decode_rlp_item(&rlp).is_err());

        // same for lists
        let rlp = vec![0xf8, 0x03, 0x01, 0x02, 0x03];
        assert!(decode_rlp_item(&rlp).is_err());

        // length field with a leading zero byte
        let mut rlp = vec![0xb9, 0x00, 0x38];
        rlp.extend(std::iter::repeat(0u8).take(56));
        assert!(decode_rlp_item(&rlp).is_err());
    }

    #[test]
    fn rejects_truncated_input() {
        let rlp = vec![RLP_NULL + 5, 0x01, 0x02];
        assert!(decode_rlp_item(&rlp).is_err());

        let rlp = vec![0xf8, 0x38, 0x01];
        assert!(decode_rlp_item(&rlp).is_err());

        let rlp: Vec<u8> = vec![];
        assert!(decode_rlp_item(&rlp).is_err());
    }

    #[test]
    fn reencoding_a_decoded_value_is_identical() {
        let values: Vec<u64> = vec![0, 1, 15, 127, 128, 1024, u64::MAX];
        for value in values {
            let encoded = value.encode_to_vec();
            let decoded = u64::decode(&encoded).unwrap();
            assert_eq!(decoded.encode_to_vec(), encoded);
        }

        let blobs: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x7f],
            vec![0xab; 55],
            vec![0xcd; 56],
            vec![0xef; 1000],
            vec![0x11; 100_000],
        ];
        for blob in blobs {
            let encoded = blob.as_slice().encode_to_vec();
            let decoded = Bytes::decode(&encoded).unwrap();
            assert_eq!(decoded.as_ref().encode_to_vec(), encoded);
        }
    }

    #[test]
    fn nested_list_round_trip() {
        // build a list nested 8 levels deep
        let value: Vec<Vec<u8>> = vec![vec![1, 2, 3]];
        let mut encoded = value.encode_to_vec();
        for _ in 0..7 {
            let mut outer = Vec::new();
            crate::encode::encode_length(encoded.len(), &mut outer);
            outer.extend_from_slice(&encoded);
            encoded = outer;
        }
        // peel the layers back off
        let mut rest = encoded.as_slice();
        for _ in 0..7 {
            let (is_list, payload, after) = decode_rlp_item(rest).unwrap();
            assert!(is_list);
            assert!(after.is_empty());
            rest = payload;
        }
        let decoded: Vec<Vec<u8>> = Vec::decode(rest).unwrap();
        assert_eq!(decoded, value);
    }
}
