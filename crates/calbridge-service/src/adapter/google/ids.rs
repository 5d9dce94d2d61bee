//! Deterministic client-supplied event ids.
//!
//! Creation on the token API uses an id derived from the canonical UID so
//! retries and cross-direction propagation are idempotent under
//! at-least-once delivery. The alphabet is base-32-hex (`[0-9a-v]`), the
//! only charset the server accepts for client ids, and the first character
//! is forced alphabetic. The alphabet must not be widened.

use sha2::{Digest, Sha256};

const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";
const ID_LEN: usize = 26;

/// Derives the stable event id for a canonical UID
#[must_use]
pub fn derive_event_id(uid: &str) -> String {
    let digest = Sha256::digest(uid.as_bytes());

    let mut out = Vec::with_capacity(ID_LEN);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &byte in digest.iter() {
        acc = (acc << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 && out.len() < ID_LEN {
            bits -= 5;
            let index = ((acc >> bits) & 0x1f) as usize;
            out.push(ALPHABET[index]);
        }
        if out.len() == ID_LEN {
            break;
        }
    }

    // Digits remap into 'a'..='j' so the id always leads with a letter
    if out[0].is_ascii_digit() {
        out[0] = b'a' + (out[0] - b'0');
    }

    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_stable() {
        let a = derive_event_id("meeting-1@example.com");
        let b = derive_event_id("meeting-1@example.com");
        assert_eq!(a, b);
        assert_eq!(a.len(), ID_LEN);
    }

    #[test]
    fn different_uids_differ() {
        assert_ne!(
            derive_event_id("meeting-1@example.com"),
            derive_event_id("meeting-2@example.com")
        );
    }

    #[test]
    fn stays_in_base32hex_alphabet() {
        for uid in ["a", "b@c", "Ünïcodé", "2f1e4a88-very-long-uid@calendar.local"] {
            let id = derive_event_id(uid);
            assert!(id.chars().all(|c| matches!(c, '0'..='9' | 'a'..='v')), "{id}");
        }
    }

    #[test]
    fn leading_character_is_alphabetic() {
        // Brute a few hundred uids; every derived id must start with a letter
        for n in 0..500 {
            let id = derive_event_id(&format!("uid-{n}@example.com"));
            assert!(id.starts_with(|c: char| c.is_ascii_lowercase()), "{id}");
        }
    }
}
