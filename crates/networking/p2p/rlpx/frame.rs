use aes::{
    cipher::{BlockEncrypt as _, KeyInit as _, KeyIvInit, StreamCipher as _},
    Aes256Enc,
};
use ethereum_types::{H128, H256};
use ethwire_rlp::{
    decode::{decode_rlp_item, RLPDecode},
    encode::RLPEncode,
};
use sha3::{Digest as _, Keccak256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroize;

use super::error::RLPxError;
use super::handshake::Aes256Ctr64BE;
use crate::MAX_MESSAGE_SIZE;

/// Inbound half of the frame cipher state.
pub struct IngressState {
    pub(crate) mac_key: H256,
    pub(crate) mac: Keccak256,
    pub(crate) aes: Aes256Ctr64BE,
}

/// Outbound half of the frame cipher state.
pub struct EgressState {
    pub(crate) mac_key: H256,
    pub(crate) mac: Keccak256,
    pub(crate) aes: Aes256Ctr64BE,
}

impl IngressState {
    /// Scrubs the key material once the peer is gone.
    pub(crate) fn wipe(&mut self) {
        self.mac_key.0.zeroize();
        self.aes = <Aes256Ctr64BE as KeyIvInit>::new(&[0; 32].into(), &[0; 16].into());
        self.mac = Keccak256::default();
    }
}

impl EgressState {
    pub(crate) fn wipe(&mut self) {
        self.mac_key.0.zeroize();
        self.aes = <Aes256Ctr64BE as KeyIvInit>::new(&[0; 32].into(), &[0; 16].into());
        self.mac = Keccak256::default();
    }
}

pub(crate) async fn write<S: AsyncWrite + Unpin>(
    mut frame_data: Vec<u8>,
    state: &mut EgressState,
    stream: &mut S,
) -> Result<(), RLPxError> {
    if frame_data.len() > MAX_MESSAGE_SIZE {
        return Err(RLPxError::MessageTooBig(MAX_MESSAGE_SIZE));
    }

    let mac_aes_cipher =
        Aes256Enc::new_from_slice(&state.mac_key.0).expect("mac key is always 32 bytes");

    // header = frame-size || header-data || header-padding
    let mut header = Vec::with_capacity(32);
    let frame_size = frame_data.len().to_be_bytes();
    header.extend_from_slice(&frame_size[5..8]);

    // header-data = [capability-id, context-id]  (both always zero)
    let header_data = (0_u8, 0_u8);
    header_data.encode(&mut header);

    header.resize(16, 0);
    state.aes.apply_keystream(&mut header[..16]);

    // header-mac-seed = aes(mac-secret, keccak256.digest(egress-mac)[:16]) ^ header-ciphertext
    let header_mac_seed = {
        let mac_digest: [u8; 16] = state.mac.clone().finalize()[..16]
            .try_into()
            .expect("Keccak-256 digests are 32 bytes");
        let mut seed = mac_digest.into();
        mac_aes_cipher.encrypt_block(&mut seed);
        let header_ciphertext: [u8; 16] = header[..16]
            .try_into()
            .expect("header was just resized to 16 bytes");
        (H128(seed.into()) ^ H128(header_ciphertext)).0
    };
    state.mac.update(header_mac_seed);
    let header_mac = state.mac.clone().finalize();
    header.extend_from_slice(&header_mac[..16]);

    stream.write_all(&header).await?;

    // Pad to next multiple of 16
    frame_data.resize(frame_data.len().next_multiple_of(16), 0);
    state.aes.apply_keystream(&mut frame_data);
    let frame_ciphertext = frame_data;

    stream.write_all(&frame_ciphertext).await?;

    // frame-mac-seed = aes(mac-secret, keccak256.digest(egress-mac)[:16]) ^ keccak256.digest(egress-mac)[:16]
    state.mac.update(&frame_ciphertext);
    let frame_mac_seed = {
        let mac_digest: [u8; 16] = state.mac.clone().finalize()[..16]
            .try_into()
            .expect("Keccak-256 digests are 32 bytes");
        let mut seed = mac_digest.into();
        mac_aes_cipher.encrypt_block(&mut seed);
        (H128(seed.into()) ^ H128(mac_digest)).0
    };
    state.mac.update(frame_mac_seed);
    let frame_mac = state.mac.clone().finalize();

    stream.write_all(&frame_mac[..16]).await?;
    Ok(())
}

pub(crate) async fn read<S: AsyncRead + Unpin>(
    state: &mut IngressState,
    stream: &mut S,
) -> Result<Vec<u8>, RLPxError> {
    let mac_aes_cipher =
        Aes256Enc::new_from_slice(&state.mac_key.0).expect("mac key is always 32 bytes");

    // Receive the message's frame header
    let mut frame_header = [0; 32];
    stream.read_exact(&mut frame_header).await?;
    // Both are padded to the block's size (16 bytes)
    let (header_ciphertext, header_mac) = frame_header.split_at_mut(16);

    // header-mac-seed = aes(mac-secret, keccak256.digest(ingress-mac)[:16]) ^ header-ciphertext
    let header_mac_seed = {
        let mac_digest: [u8; 16] = state.mac.clone().finalize()[..16]
            .try_into()
            .expect("Keccak-256 digests are 32 bytes");
        let mut seed = mac_digest.into();
        mac_aes_cipher.encrypt_block(&mut seed);
        let header_ciphertext: [u8; 16] = (&*header_ciphertext)
            .try_into()
            .expect("split_at_mut(16) yields 16 bytes");
        (H128(seed.into()) ^ H128(header_ciphertext)).0
    };
    state.mac.update(header_mac_seed);

    let expected_header_mac = &state.mac.clone().finalize()[..16];
    if header_mac != expected_header_mac {
        return Err(RLPxError::BreachOfProtocol(
            "frame header MAC mismatch".to_string(),
        ));
    }

    let header_text = header_ciphertext;
    state.aes.apply_keystream(header_text);

    let frame_size =
        u32::from_be_bytes([0, header_text[0], header_text[1], header_text[2]]) as usize;
    if frame_size > MAX_MESSAGE_SIZE {
        return Err(RLPxError::MessageTooBig(MAX_MESSAGE_SIZE));
    }

    check_header_data(&header_text[3..16])?;

    let padded_size = frame_size.next_multiple_of(16);
    let mut frame_data = vec![0; padded_size + 16];
    stream.read_exact(&mut frame_data).await?;
    let (frame_ciphertext, frame_mac) = frame_data.split_at_mut(padded_size);

    // check MAC
    state.mac.update(&*frame_ciphertext);
    let frame_mac_seed = {
        let mac_digest: [u8; 16] = state.mac.clone().finalize()[..16]
            .try_into()
            .expect("Keccak-256 digests are 32 bytes");
        let mut seed = mac_digest.into();
        mac_aes_cipher.encrypt_block(&mut seed);
        (H128(seed.into()) ^ H128(mac_digest)).0
    };
    state.mac.update(frame_mac_seed);
    let expected_frame_mac = &state.mac.clone().finalize()[..16];
    if frame_mac != expected_frame_mac {
        return Err(RLPxError::BreachOfProtocol(
            "frame body MAC mismatch".to_string(),
        ));
    }

    // decrypt frame
    state.aes.apply_keystream(frame_ciphertext);

    let (frame_data, _padding) = frame_ciphertext.split_at(frame_size);

    Ok(frame_data.to_vec())
}

/// Decodes the header-data options `[capability-id, context-id, total-size]`.
/// Items left out of the list count as zero.
fn decode_header_data(header_data: &[u8]) -> Result<[u64; 3], RLPxError> {
    let breach = |_| RLPxError::BreachOfProtocol("undecodable frame header-data".to_string());

    let (is_list, payload, _padding) = decode_rlp_item(header_data).map_err(breach)?;
    if !is_list {
        return Err(RLPxError::BreachOfProtocol(
            "frame header-data is not a list".to_string(),
        ));
    }

    let mut options = [0u64; 3];
    let mut rest = payload;
    for option in &mut options {
        if rest.is_empty() {
            break;
        }
        let (value, remaining) = u64::decode_unfinished(rest).map_err(breach)?;
        *option = value;
        rest = remaining;
    }
    Ok(options)
}

/// The options belong to the obsolete chunked-frame scheme; outside of it any
/// non-zero value is a protocol breach.
#[cfg(not(feature = "chunked-frames"))]
fn check_header_data(header_data: &[u8]) -> Result<(), RLPxError> {
    let [capability_id, context_id, total_size] = decode_header_data(header_data)?;
    if capability_id != 0 || context_id != 0 || total_size != 0 {
        return Err(RLPxError::BreachOfProtocol(format!(
            "chunked frame options in use: capability-id {capability_id}, context-id {context_id}, total-size {total_size}"
        )));
    }
    Ok(())
}

/// With chunked frames tolerated, the options are decoded and logged only.
#[cfg(feature = "chunked-frames")]
fn check_header_data(header_data: &[u8]) -> Result<(), RLPxError> {
    let [capability_id, context_id, total_size] = decode_header_data(header_data)?;
    if capability_id != 0 || context_id != 0 || total_size != 0 {
        tracing::debug!(
            capability_id,
            context_id,
            total_size,
            "chunked frame header-data"
        );
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn state_parts(aes_key: H256, mac_key: H256, mac: Keccak256) -> (Aes256Ctr64BE, H256, Keccak256) {
        let aes = <Aes256Ctr64BE as KeyIvInit>::new(&aes_key.0.into(), &[0; 16].into());
        (aes, mac_key, mac)
    }

    /// Builds a mirrored pair of cipher states, as if both ends had completed
    /// the same handshake. Returns (a_egress, b_ingress).
    pub(crate) fn secrets_pair() -> (EgressState, IngressState) {
        let aes_key = H256::repeat_byte(0x11);
        let mac_key = H256::repeat_byte(0x22);
        let seed = Keccak256::new_with_prefix(b"mac seed");

        let (aes, mac_key, mac) = state_parts(aes_key, mac_key, seed);
        let egress = EgressState {
            mac_key,
            mac: mac.clone(),
            aes: aes.clone(),
        };
        let ingress = IngressState { mac_key, mac, aes };
        (egress, ingress)
    }

    async fn round_trip(payload: Vec<u8>) {
        let (mut egress, mut ingress) = secrets_pair();
        let (mut left, mut right) = tokio::io::duplex(2 * MAX_MESSAGE_SIZE + 1024);

        write(payload.clone(), &mut egress, &mut left).await.unwrap();
        let read_back = read(&mut ingress, &mut right).await.unwrap();
        assert_eq!(read_back, payload);
    }

    #[tokio::test]
    async fn frame_round_trip_small_sizes() {
        for size in [1usize, 15, 16, 17, 1024] {
            round_trip(vec![0x5a; size]).await;
        }
    }

    #[tokio::test]
    async fn frame_round_trip_max_size() {
        round_trip(vec![0x5a; MAX_MESSAGE_SIZE - 1]).await;
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected() {
        let (mut egress, _) = secrets_pair();
        let (mut left, _right) = tokio::io::duplex(64);
        let result = write(vec![0; MAX_MESSAGE_SIZE + 1], &mut egress, &mut left).await;
        assert!(matches!(result, Err(RLPxError::MessageTooBig(_))));
    }

    #[tokio::test]
    async fn several_messages_share_the_cipher_stream() {
        let (mut egress, mut ingress) = secrets_pair();
        let (mut left, mut right) = tokio::io::duplex(1 << 16);

        for size in [3usize, 100, 17] {
            let payload = vec![size as u8; size];
            write(payload.clone(), &mut egress, &mut left).await.unwrap();
            let read_back = read(&mut ingress, &mut right).await.unwrap();
            assert_eq!(read_back, payload);
        }
    }

    #[tokio::test]
    async fn corrupted_header_mac_is_a_breach() {
        let (mut egress, mut ingress) = secrets_pair();
        let (mut left, mut right) = tokio::io::duplex(1 << 16);

        write(vec![1, 2, 3], &mut egress, &mut left).await.unwrap();

        let mut raw = vec![0; 32 + 16 + 16];
        right.read_exact(&mut raw).await.unwrap();
        raw[20] ^= 0xff; // flip a bit inside the header MAC

        let (mut corrupt_tx, mut corrupt_rx) = tokio::io::duplex(1 << 16);
        corrupt_tx.write_all(&raw).await.unwrap();
        let result = read(&mut ingress, &mut corrupt_rx).await;
        assert!(matches!(result, Err(RLPxError::BreachOfProtocol(_))));
    }

    #[cfg(not(feature = "chunked-frames"))]
    #[test]
    fn nonzero_header_data_is_a_breach() {
        // header-data announcing capability-id 1
        let mut header_data = Vec::new();
        (1_u8, 0_u8).encode(&mut header_data);
        header_data.resize(13, 0);
        assert!(check_header_data(&header_data).is_err());

        // all-zero options pass
        let mut header_data = Vec::new();
        (0_u8, 0_u8).encode(&mut header_data);
        header_data.resize(13, 0);
        check_header_data(&header_data).unwrap();
    }
}
