/// Prefix of the empty blob, also the encoding of integer zero.
pub const RLP_NULL: u8 = 0x80;
/// Prefix of the empty list.
pub const RLP_EMPTY_LIST: u8 = 0xC0;
/// Payloads shorter than this use the short (single prefix byte) form.
pub const RLP_SHORT_LEN_LIMIT: usize = 56;
