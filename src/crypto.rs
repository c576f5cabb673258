//! Per-session message envelope: AES-256-GCM under an X25519 shared secret.
//!
//! The envelope is stateless with respect to sequencing — callers supply
//! the sequence number on encrypt and check monotonicity on decrypt. What
//! the envelope does enforce is integrity of the sequence itself: the
//! plaintext carries a second copy of the outer sequence number, and a
//! frame whose decrypted copy disagrees with the header is rejected.

use crate::protocol::{ENVELOPE_HEADER_SIZE, IV_SIZE, MAC_SIZE, SEQUENCE_SIZE};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Curve25519 key and AES-256 key size.
pub const KEY_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("bad key material: {0}")]
    BadKey(String),
    #[error("cipher failure")]
    Failure,
    #[error("decrypted sequence number does not match the envelope header")]
    SequenceMismatch,
    #[error("frame too short ({0} bytes)")]
    FrameTooShort(usize),
}

/// The session keys as provisioned: base64 curve25519 byte strings.
pub struct KeyMaterial<'a> {
    pub client_public: &'a str,
    pub client_private: &'a str,
    pub peer_public: &'a str,
}

fn decode_key(label: &str, b64: &str) -> Result<[u8; KEY_SIZE], CryptoError> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| CryptoError::BadKey(format!("{label}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::BadKey(format!("{label}: expected {KEY_SIZE} bytes")))
}

/// Derive the 32-byte shared secret from the provisioned keypair and the
/// service public key.
///
/// Keys decode to the canonical little-endian curve25519 encoding;
/// clamping of the private scalar happens inside the X25519 function.
pub fn derive_shared_secret(keys: &KeyMaterial<'_>) -> Result<[u8; KEY_SIZE], CryptoError> {
    let private = StaticSecret::from(decode_key("client private key", keys.client_private)?);
    let peer = PublicKey::from(decode_key("peer public key", keys.peer_public)?);

    // The provisioned public key is redundant with the private one; a
    // mismatch means the credential set is inconsistent.
    if !keys.client_public.is_empty() {
        let expected = decode_key("client public key", keys.client_public)?;
        if PublicKey::from(&private).as_bytes() != &expected {
            tracing::warn!("client public key does not match the private key; using the derived one");
        }
    }

    Ok(*private.diffie_hellman(&peer).as_bytes())
}

/// Session crypto context: one AES-256-GCM cipher plus the IV generator.
pub struct CryptoContext {
    cipher: Aes256Gcm,
    /// IV source, seeded from OS entropy mixed with the shared secret.
    rng: Mutex<StdRng>,
}

impl CryptoContext {
    pub fn new(keys: &KeyMaterial<'_>) -> Result<Self, CryptoError> {
        Ok(Self::from_secret(derive_shared_secret(keys)?))
    }

    /// Build a context directly from a 32-byte shared secret.
    pub fn from_secret(secret: [u8; KEY_SIZE]) -> Self {
        let mut entropy = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut entropy);

        let mut hasher = Sha256::new();
        hasher.update(entropy);
        hasher.update(secret);
        let seed: [u8; KEY_SIZE] = hasher.finalize().into();

        CryptoContext {
            cipher: Aes256Gcm::new_from_slice(&secret).expect("32-byte key"),
            rng: Mutex::new(StdRng::from_seed(seed)),
        }
    }

    /// Seal `plaintext` under `sequence` into a wire frame:
    /// `seq | iv | mac | ciphertext`, where the ciphertext covers
    /// `seq | plaintext`.
    pub fn encrypt(&self, sequence: u32, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut iv = [0u8; IV_SIZE];
        self.rng.lock().unwrap().fill_bytes(&mut iv);

        let mut blob = Vec::with_capacity(SEQUENCE_SIZE + plaintext.len());
        blob.extend_from_slice(&sequence.to_le_bytes());
        blob.extend_from_slice(plaintext);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), Payload { msg: &blob, aad: &[] })
            .map_err(|_| CryptoError::Failure)?;
        // aes-gcm appends the tag; the wire format wants it up front.
        let (ciphertext, mac) = sealed.split_at(sealed.len() - MAC_SIZE);

        let mut frame = Vec::with_capacity(ENVELOPE_HEADER_SIZE + ciphertext.len());
        frame.extend_from_slice(&sequence.to_le_bytes());
        frame.extend_from_slice(&iv);
        frame.extend_from_slice(mac);
        frame.extend_from_slice(ciphertext);
        Ok(frame)
    }

    /// Open a wire frame, returning the outer sequence number and the
    /// plaintext body (without the inner sequence prefix).
    pub fn decrypt(&self, frame: &[u8]) -> Result<(u32, Vec<u8>), CryptoError> {
        if frame.len() < ENVELOPE_HEADER_SIZE {
            return Err(CryptoError::FrameTooShort(frame.len()));
        }
        let sequence = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        let iv = &frame[SEQUENCE_SIZE..SEQUENCE_SIZE + IV_SIZE];
        let mac = &frame[SEQUENCE_SIZE + IV_SIZE..ENVELOPE_HEADER_SIZE];
        let ciphertext = &frame[ENVELOPE_HEADER_SIZE..];

        let mut sealed = Vec::with_capacity(ciphertext.len() + MAC_SIZE);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(mac);

        let blob = self
            .cipher
            .decrypt(Nonce::from_slice(iv), Payload { msg: &sealed, aad: &[] })
            .map_err(|_| CryptoError::Failure)?;

        if blob.len() < SEQUENCE_SIZE {
            return Err(CryptoError::FrameTooShort(blob.len()));
        }
        let inner = u32::from_le_bytes(blob[0..4].try_into().unwrap());
        if inner != sequence {
            return Err(CryptoError::SequenceMismatch);
        }
        Ok((sequence, blob[SEQUENCE_SIZE..].to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> CryptoContext {
        CryptoContext::from_secret([0x42u8; KEY_SIZE])
    }

    #[test]
    fn x25519_shared_secret_rfc7748_vector() {
        // Scalar and coordinate from RFC 7748 §5.2, vector 1.
        let keys = KeyMaterial {
            client_public: "",
            client_private: "pUbja/BSfJ07FhVLgkZe3WIUTArB/FoYUGoiRLpEmsQ=",
            peer_public: "5ttoZ1gwMNs1lMGkJLFffHJmJOwmszU7EKkDptCrHEw=",
        };
        let secret = derive_shared_secret(&keys).unwrap();
        let expected = [
            0xc3, 0xda, 0x55, 0x37, 0x9d, 0xe9, 0xc6, 0x90, 0x8e, 0x94, 0xea, 0x4d, 0xf2, 0x8d,
            0x08, 0x4f, 0x32, 0xec, 0xcf, 0x03, 0x49, 0x1c, 0x71, 0xf7, 0x54, 0xb4, 0x07, 0x55,
            0x77, 0xa2, 0x85, 0x52,
        ];
        assert_eq!(secret, expected);
    }

    #[test]
    fn both_sides_derive_the_same_secret() {
        let a_private = [0x11u8; KEY_SIZE];
        let b_private = [0x22u8; KEY_SIZE];
        let a_public = *PublicKey::from(&StaticSecret::from(a_private)).as_bytes();
        let b_public = *PublicKey::from(&StaticSecret::from(b_private)).as_bytes();

        let a = derive_shared_secret(&KeyMaterial {
            client_public: &BASE64.encode(a_public),
            client_private: &BASE64.encode(a_private),
            peer_public: &BASE64.encode(b_public),
        })
        .unwrap();
        let b = derive_shared_secret(&KeyMaterial {
            client_public: &BASE64.encode(b_public),
            client_private: &BASE64.encode(b_private),
            peer_public: &BASE64.encode(a_public),
        })
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn malformed_key_is_rejected() {
        let keys = KeyMaterial {
            client_public: "",
            client_private: "not base64 !!!",
            peer_public: "5ttoZ1gwMNs1lMGkJLFffHJmJOwmszU7EKkDptCrHEw=",
        };
        assert!(matches!(derive_shared_secret(&keys), Err(CryptoError::BadKey(_))));
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let ctx = context();
        let plaintext = b"{\"events\":[]}";

        let frame = ctx.encrypt(7, plaintext).unwrap();
        // seq + iv + mac + (inner seq + plaintext)
        assert_eq!(frame.len(), ENVELOPE_HEADER_SIZE + SEQUENCE_SIZE + plaintext.len());

        let (seq, body) = ctx.decrypt(&frame).unwrap();
        assert_eq!(seq, 7);
        assert_eq!(body, plaintext);
    }

    #[test]
    fn every_frame_gets_a_fresh_iv() {
        let ctx = context();
        let a = ctx.encrypt(0, b"same").unwrap();
        let b = ctx.encrypt(0, b"same").unwrap();
        assert_ne!(a[4..16], b[4..16]);
        assert_ne!(a, b);
    }

    #[test]
    fn bit_flips_anywhere_fail_authentication() {
        let ctx = context();
        let frame = ctx.encrypt(3, b"tamper target payload").unwrap();

        // One flip in the IV, the MAC, and the ciphertext respectively.
        for position in [SEQUENCE_SIZE, SEQUENCE_SIZE + IV_SIZE, ENVELOPE_HEADER_SIZE] {
            let mut bad = frame.clone();
            bad[position] ^= 0x01;
            assert!(
                matches!(ctx.decrypt(&bad), Err(CryptoError::Failure)),
                "flip at byte {position} must fail authentication"
            );
        }
    }

    #[test]
    fn outer_sequence_tamper_reports_mismatch() {
        let ctx = context();
        let mut frame = ctx.encrypt(5, b"payload").unwrap();
        frame[0..4].copy_from_slice(&6u32.to_le_bytes());
        // The header is not authenticated on its own; the inner copy is
        // what catches the rewrite.
        assert!(matches!(ctx.decrypt(&frame), Err(CryptoError::SequenceMismatch)));
    }

    #[test]
    fn short_frame_is_rejected() {
        let ctx = context();
        assert!(matches!(
            ctx.decrypt(&[0u8; ENVELOPE_HEADER_SIZE - 1]),
            Err(CryptoError::FrameTooShort(_))
        ));
    }

    #[test]
    fn wrong_secret_fails() {
        let frame = context().encrypt(1, b"secret").unwrap();
        let other = CryptoContext::from_secret([0x43u8; KEY_SIZE]);
        assert!(matches!(other.decrypt(&frame), Err(CryptoError::Failure)));
    }
}
