//! Per-packet ChaCha20-Poly1305 encryption for outbound RTP audio (C4, spec §4.5).

use super::packet::RtpHeader;
use crate::protocol::crypto::{ChaCha20Poly1305Cipher, CryptoError, Nonce};
use thiserror::Error;

/// Errors from packet encryption/decryption.
#[derive(Debug, Error)]
pub enum RtpCodecError {
    /// Underlying AEAD failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Packet shorter than the 12-byte RTP header.
    #[error("packet shorter than RTP header: {0} bytes")]
    TooShort(usize),
}

/// Encrypts (and, for tests, decrypts) RTP audio payloads per spec
/// §4.5: nonce is four zero bytes followed by the little-endian 16-bit
/// sequence number padded to 8 bytes; associated data is RTP header
/// bytes 4..12 (timestamp + SSRC); output is
/// `header || ciphertext || tag(16) || nonce_tail(8)`.
///
/// The nonce depends only on the sequence number, so re-encrypting the
/// same seqnum for a retransmit yields byte-identical ciphertext
/// (invariant 2).
pub struct PacketEncryptor {
    cipher: ChaCha20Poly1305Cipher,
}

impl PacketEncryptor {
    /// Build an encryptor from the 32-byte key derived at pair-verify
    /// or pair-setup/transient completion.
    pub fn new(key: &[u8; 32]) -> Result<Self, RtpCodecError> {
        Ok(Self {
            cipher: ChaCha20Poly1305Cipher::new(key)?,
        })
    }

    /// Encrypt one RTP audio packet: `header` is the 12-byte cleartext
    /// RTP header (used verbatim on the wire and for AAD), `payload`
    /// is the ALAC-framed PCM.
    ///
    /// Returns the complete wire packet.
    pub fn encrypt(&self, header: &RtpHeader, payload: &[u8]) -> Result<Vec<u8>, RtpCodecError> {
        let header_bytes = header.encode();
        let nonce = Nonce::from_counter(u64::from(header.sequence));
        let aad = &header_bytes[4..12];
        let ciphertext = self.cipher.encrypt_with_aad(&nonce, aad, payload)?;

        let mut out = Vec::with_capacity(RtpHeader::SIZE + ciphertext.len() + 8);
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&nonce.as_bytes()[4..12]);
        Ok(out)
    }

    /// Decrypt a packet produced by [`Self::encrypt`]. Not used on the
    /// sender's hot path; exists for round-trip tests.
    pub fn decrypt(&self, wire: &[u8]) -> Result<Vec<u8>, RtpCodecError> {
        if wire.len() < RtpHeader::SIZE + 16 + 8 {
            return Err(RtpCodecError::TooShort(wire.len()));
        }
        let header_bytes = &wire[..RtpHeader::SIZE];
        let nonce_tail = &wire[wire.len() - 8..];
        let ciphertext = &wire[RtpHeader::SIZE..wire.len() - 8];

        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[4..12].copy_from_slice(nonce_tail);
        let nonce = Nonce::from_bytes(&nonce_bytes)?;

        let aad = &header_bytes[4..12];
        Ok(self.cipher.decrypt_with_aad(&nonce, aad, ciphertext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::packet::PayloadType;

    fn key() -> [u8; 32] {
        [7u8; 32]
    }

    fn header(seq: u16, ts: u32) -> RtpHeader {
        RtpHeader {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: PayloadType::AudioRealtime,
            sequence: seq,
            timestamp: ts,
            ssrc: 0xAABB_CCDD,
        }
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let enc = PacketEncryptor::new(&key()).unwrap();
        let payload = b"some alac bytes here";
        let wire = enc.encrypt(&header(42, 1000), payload).unwrap();
        let plain = enc.decrypt(&wire).unwrap();
        assert_eq!(plain, payload);
    }

    #[test]
    fn retransmit_is_byte_identical() {
        // invariant 2: same seqnum encrypts to the same ciphertext
        let enc = PacketEncryptor::new(&key()).unwrap();
        let payload = b"identical payload";
        let wire1 = enc.encrypt(&header(7, 500), payload).unwrap();
        let wire2 = enc.encrypt(&header(7, 500), payload).unwrap();
        assert_eq!(wire1, wire2);
    }

    #[test]
    fn different_seqnum_differs() {
        let enc = PacketEncryptor::new(&key()).unwrap();
        let payload = b"same payload bytes";
        let wire1 = enc.encrypt(&header(1, 0), payload).unwrap();
        let wire2 = enc.encrypt(&header(2, 0), payload).unwrap();
        assert_ne!(wire1, wire2);
    }

    #[test]
    fn wire_layout_matches_header_then_cipher_then_tag_then_nonce_tail() {
        let enc = PacketEncryptor::new(&key()).unwrap();
        let payload = b"abcd";
        let wire = enc.encrypt(&header(9, 0), payload).unwrap();
        assert_eq!(wire.len(), RtpHeader::SIZE + payload.len() + 16 + 8);
        assert_eq!(&wire[wire.len() - 8..wire.len() - 6], &9u16.to_le_bytes());
    }
}
