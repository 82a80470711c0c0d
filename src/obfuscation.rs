//! # Zero-Overhead Packet Obfuscation
//!
//! Every packet that leaves a bind is passed through [`ZeroOverhead`] and
//! every packet read from a bind is passed back through it before the
//! session layer sees the bytes. The transform is keyed by a 32-byte
//! pre-shared key that is independent of the session keys.
//!
//! ## Two modes
//!
//! | Packet | First 16 bytes | Remainder | Size change |
//! |--------|----------------|-----------|-------------|
//! | Data | AES-256 single block | untouched | none |
//! | Control | AES-256 single block | padded + sealed with XChaCha20-Poly1305 | +padding +tag +nonce +2 |
//!
//! Encrypting the first block hides the message kind and any protocol
//! constants from on-path classifiers. Control traffic is low-rate, so it
//! additionally gets random-length padding and an AEAD seal; data traffic
//! keeps its exact size so the tunnel MTU is unaffected.
//!
//! ## Wire layout
//!
//! ```text
//! data:    AES_ECB(plain[0..16]) || plain[16..]
//! control: AES_ECB(plain[0..16]) || AEAD(plain[16..] || pad || BE16(len)) || nonce(24)
//! ```
//!
//! The padded length marker is a big-endian u16 at the end of the sealed
//! body, which caps the control-packet remainder at 65535 bytes.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use rand::rngs::OsRng;

/// AES block size; packets shorter than this pass through unmodified.
pub const FIRST_BLOCK_LEN: usize = 16;

/// Poly1305 tag appended by the AEAD seal.
pub const AEAD_TAG_LEN: usize = 16;

/// XChaCha20 extended nonce carried at the end of every control packet.
pub const NONCE_LEN: usize = 24;

// ----------------------------------------------------------------------------
// Control-plane message kinds
// ----------------------------------------------------------------------------
//
// The first plaintext byte of a wire packet names its kind. These six values
// are the control-plane messages that receive padding and a full seal; any
// other value is user-plane data.

/// Edge registration with a supernode.
pub const KIND_REGISTER: u8 = 1;
/// Supernode push of updated peer/route state.
pub const KIND_SERVER_UPDATE: u8 = 2;
/// Latency probe request.
pub const KIND_PING: u8 = 3;
/// Latency probe reply.
pub const KIND_PONG: u8 = 4;
/// Ask a peer for another peer's endpoints.
pub const KIND_QUERY_PEER: u8 = 5;
/// Gossip a peer's endpoints to neighbors.
pub const KIND_BROADCAST_PEER: u8 = 6;

/// True if the byte names one of the six control-plane message kinds.
pub fn is_control_kind(kind: u8) -> bool {
    (KIND_REGISTER..=KIND_BROADCAST_PEER).contains(&kind)
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Failures of the obfuscation transform.
///
/// Send-path errors are returned to the caller; receive-path errors cause the
/// packet to be dropped, never the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObfuscationError {
    /// The pre-shared key is not exactly 32 bytes.
    InvalidKeyLength,
    /// A control packet does not fit `max_control_packet_size`.
    PacketTooLarge,
    /// A control packet is truncated or its embedded length is inconsistent.
    InvalidLength,
    /// AEAD open failed: forged, corrupted, or wrong-key ciphertext.
    Aead,
}

impl std::fmt::Display for ObfuscationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObfuscationError::InvalidKeyLength => write!(f, "PSK must be 32 bytes"),
            ObfuscationError::PacketTooLarge => write!(f, "control packet is too large"),
            ObfuscationError::InvalidLength => write!(f, "invalid control packet length"),
            ObfuscationError::Aead => write!(f, "control packet failed authentication"),
        }
    }
}

impl std::error::Error for ObfuscationError {}

// ----------------------------------------------------------------------------
// Handler
// ----------------------------------------------------------------------------

/// Symmetric packet transform shared immutably by all send/receive workers.
///
/// Construction derives both ciphers from the same PSK; the handler is
/// immutable afterwards and cheap to share behind an `Arc`.
pub struct ZeroOverhead {
    block: Option<Aes256>,
    aead: Option<XChaCha20Poly1305>,
    max_packet_size: usize,
    max_control_packet_size: usize,
    enabled: bool,
}

impl ZeroOverhead {
    /// Build a handler. With `enabled == false` both transforms are the
    /// identity and the PSK is ignored.
    pub fn new(psk: &[u8], max_packet_size: usize, enabled: bool) -> Result<Self, ObfuscationError> {
        if !enabled {
            return Ok(Self {
                block: None,
                aead: None,
                max_packet_size: 0,
                max_control_packet_size: 0,
                enabled: false,
            });
        }

        if psk.len() != 32 {
            return Err(ObfuscationError::InvalidKeyLength);
        }

        let key = GenericArray::from_slice(psk);
        let block = Aes256::new(key);
        let aead = XChaCha20Poly1305::new(key);

        let max_control_packet_size = max_packet_size - 2 - AEAD_TAG_LEN - NONCE_LEN;

        Ok(Self {
            block: Some(block),
            aead: Some(aead),
            max_packet_size,
            max_control_packet_size,
            enabled: true,
        })
    }

    /// Whether the transform is active.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Bytes added to a data packet: always zero.
    pub fn overhead(&self) -> usize {
        0
    }

    /// Largest plaintext control packet that can be sealed without exceeding
    /// `max_packet_size` on the wire.
    pub fn max_control_packet_size(&self) -> usize {
        self.max_control_packet_size
    }

    /// Largest wire packet the handler was sized for.
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Obfuscate an outbound packet.
    pub fn encrypt(&self, packet: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        if !self.enabled || packet.len() < FIRST_BLOCK_LEN {
            return Ok(packet.to_vec());
        }
        let block = self.block.as_ref().expect("enabled handler has ciphers");
        let aead = self.aead.as_ref().expect("enabled handler has ciphers");

        let kind = packet[0];

        let mut dst = Vec::with_capacity(packet.len() + 2 + AEAD_TAG_LEN + NONCE_LEN);
        let mut first = GenericArray::clone_from_slice(&packet[..FIRST_BLOCK_LEN]);
        block.encrypt_block(&mut first);
        dst.extend_from_slice(&first);

        let remainder = &packet[FIRST_BLOCK_LEN..];
        if !is_control_kind(kind) {
            dst.extend_from_slice(remainder);
            return Ok(dst);
        }

        if packet.len() > self.max_control_packet_size || remainder.len() > 65535 {
            return Err(ObfuscationError::PacketTooLarge);
        }
        let headroom = self.max_control_packet_size - packet.len();

        let padding_len = if headroom > 0 {
            1 + (rand::thread_rng().next_u32() as usize) % headroom
        } else {
            0
        };

        let mut body = Vec::with_capacity(remainder.len() + padding_len + 2);
        body.extend_from_slice(remainder);
        if padding_len > 0 {
            let mut padding = vec![0u8; padding_len];
            OsRng.fill_bytes(&mut padding);
            body.extend_from_slice(&padding);
        }
        body.extend_from_slice(&(remainder.len() as u16).to_be_bytes());

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = aead
            .encrypt(XNonce::from_slice(&nonce), body.as_slice())
            .map_err(|_| ObfuscationError::Aead)?;
        dst.extend_from_slice(&sealed);
        dst.extend_from_slice(&nonce);

        Ok(dst)
    }

    /// Invert [`encrypt`](Self::encrypt) on an inbound packet.
    pub fn decrypt(&self, packet: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        if !self.enabled || packet.len() < FIRST_BLOCK_LEN {
            return Ok(packet.to_vec());
        }
        let block = self.block.as_ref().expect("enabled handler has ciphers");
        let aead = self.aead.as_ref().expect("enabled handler has ciphers");

        let mut first = GenericArray::clone_from_slice(&packet[..FIRST_BLOCK_LEN]);
        block.decrypt_block(&mut first);

        // A ciphertext first byte can land in the control range by chance;
        // the decrypted kind byte is authoritative.
        if !is_control_kind(first[0]) {
            let mut dst = Vec::with_capacity(packet.len());
            dst.extend_from_slice(&first);
            dst.extend_from_slice(&packet[FIRST_BLOCK_LEN..]);
            return Ok(dst);
        }

        let min_len = FIRST_BLOCK_LEN + 2 + AEAD_TAG_LEN + NONCE_LEN;
        if packet.len() < min_len {
            return Err(ObfuscationError::InvalidLength);
        }

        let nonce_start = packet.len() - NONCE_LEN;
        let nonce = XNonce::from_slice(&packet[nonce_start..]);
        let ciphertext = &packet[FIRST_BLOCK_LEN..nonce_start];

        let body = aead
            .decrypt(nonce, ciphertext)
            .map_err(|_| ObfuscationError::Aead)?;
        if body.len() < 2 {
            return Err(ObfuscationError::InvalidLength);
        }

        let mut dst = Vec::with_capacity(FIRST_BLOCK_LEN + body.len());
        dst.extend_from_slice(&first);
        dst.extend_from_slice(&body);

        let padding_end = dst.len() - 2;
        let remainder_len =
            u16::from_be_bytes([dst[padding_end], dst[padding_end + 1]]) as usize;
        let total = FIRST_BLOCK_LEN + remainder_len;
        if total > padding_end {
            return Err(ObfuscationError::InvalidLength);
        }
        dst.truncate(total);

        Ok(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(max: usize) -> ZeroOverhead {
        let mut psk = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut psk);
        ZeroOverhead::new(&psk, max, true).expect("handler construction")
    }

    #[test]
    fn data_packet_tail_is_untouched() {
        let h = handler(1452);

        let mut packet = vec![0u8; 128];
        rand::thread_rng().fill_bytes(&mut packet[1..]);
        packet[0] = 0; // data kind

        let encrypted = h.encrypt(&packet).unwrap();
        assert_eq!(encrypted.len(), packet.len());
        assert_ne!(&encrypted[..16], &packet[..16]);
        assert_eq!(&encrypted[16..], &packet[16..]);

        let decrypted = h.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, packet);
    }

    #[test]
    fn control_packets_round_trip_for_every_kind() {
        let h = handler(1452);

        for kind in [
            KIND_REGISTER,
            KIND_SERVER_UPDATE,
            KIND_PING,
            KIND_PONG,
            KIND_QUERY_PEER,
            KIND_BROADCAST_PEER,
        ] {
            let mut packet = vec![0u8; 128];
            rand::thread_rng().fill_bytes(&mut packet[1..]);
            packet[0] = kind;

            let encrypted = h.encrypt(&packet).unwrap();
            assert!(encrypted.len() > packet.len(), "kind {kind}: control packet must grow");
            assert_ne!(&encrypted[..16], &packet[..16]);
            assert_ne!(&encrypted[16..packet.len()], &packet[16..]);

            let decrypted = h.decrypt(&encrypted).unwrap();
            assert_eq!(decrypted, packet, "kind {kind}: round trip");
        }
    }

    #[test]
    fn deterministic_data_vectors() {
        let psk = [0xA5u8; 32];
        let h = ZeroOverhead::new(&psk, 1452, true).unwrap();

        let packet: Vec<u8> = (0u8..=0x7F).collect();
        let encrypted = h.encrypt(&packet).unwrap();
        assert_eq!(encrypted.len(), 128);
        assert_eq!(&encrypted[16..], &packet[16..]);
        assert_eq!(h.decrypt(&encrypted).unwrap(), packet);
    }

    #[test]
    fn deterministic_control_vector() {
        let psk = [0xA5u8; 32];
        let h = ZeroOverhead::new(&psk, 1452, true).unwrap();

        let mut packet: Vec<u8> = (0u8..=0x7F).collect();
        packet[0] = KIND_PING;
        let encrypted = h.encrypt(&packet).unwrap();
        assert!(encrypted.len() >= 128 + 2 + AEAD_TAG_LEN + NONCE_LEN);
        assert!(encrypted.len() <= h.max_control_packet_size() + 2 + AEAD_TAG_LEN + NONCE_LEN);
        assert_eq!(h.decrypt(&encrypted).unwrap(), packet);
    }

    #[test]
    fn short_packets_pass_through() {
        let h = handler(1452);
        let packet = [1u8, 2, 3, 4];
        assert_eq!(h.encrypt(&packet).unwrap(), packet);
        assert_eq!(h.decrypt(&packet).unwrap(), packet);
    }

    #[test]
    fn disabled_handler_is_identity() {
        let h = ZeroOverhead::new(&[], 1452, false).unwrap();
        assert!(!h.enabled());

        let mut packet = vec![0u8; 128];
        rand::thread_rng().fill_bytes(&mut packet);
        assert_eq!(h.encrypt(&packet).unwrap(), packet);
        assert_eq!(h.decrypt(&packet).unwrap(), packet);
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        assert_eq!(
            ZeroOverhead::new(&[0u8; 16], 1452, true).err(),
            Some(ObfuscationError::InvalidKeyLength)
        );
    }

    #[test]
    fn control_packet_at_capacity_has_no_padding() {
        let h = handler(256);
        let max = h.max_control_packet_size();

        let mut packet = vec![0u8; max];
        packet[0] = KIND_REGISTER;
        let encrypted = h.encrypt(&packet).unwrap();
        // headroom == 0 forces pad == 0: exactly tag + nonce + length marker.
        assert_eq!(encrypted.len(), max + 2 + AEAD_TAG_LEN + NONCE_LEN);
        assert_eq!(h.decrypt(&encrypted).unwrap(), packet);
    }

    #[test]
    fn oversized_control_packet_is_rejected() {
        let h = handler(256);
        let mut packet = vec![0u8; h.max_control_packet_size() + 1];
        packet[0] = KIND_REGISTER;
        assert_eq!(h.encrypt(&packet).err(), Some(ObfuscationError::PacketTooLarge));
    }

    #[test]
    fn truncated_control_packet_fails_with_typed_error() {
        let h = handler(1452);
        let mut packet = vec![0u8; 128];
        packet[0] = KIND_PONG;
        let encrypted = h.encrypt(&packet).unwrap();

        // Losing the last nonce byte must surface as an error, never a panic.
        let truncated = &encrypted[..encrypted.len() - 1];
        assert!(h.decrypt(truncated).is_err());
    }

    #[test]
    fn tampered_control_packet_fails_authentication() {
        let h = handler(1452);
        let mut packet = vec![0u8; 64];
        packet[0] = KIND_QUERY_PEER;
        let mut encrypted = h.encrypt(&packet).unwrap();
        encrypted[20] ^= 0xFF;
        assert_eq!(h.decrypt(&encrypted).err(), Some(ObfuscationError::Aead));
    }
}
