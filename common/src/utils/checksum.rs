use sha1::{Digest as Sha1Digest, Sha1};
use sha2::Sha256;
use unicode_normalization::UnicodeNormalization;

/// SHA-1 hex digest of raw document bytes. Keys the chunk space of a source.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex_encode(&hasher.finalize())
}

/// SHA-256 hex digest of the NFC-normalized requirement title.
/// This is the identity used by the evaluation and rewrite caches.
pub fn requirement_checksum(title: &str) -> String {
    let normalized: String = title.nfc().collect();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().saturating_mul(2));
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_matches_known_vector() {
        // sha1("abc") is a fixed test vector
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn checksum_is_stable_under_unicode_normalization() {
        // "é" composed vs decomposed must hash identically after NFC
        let composed = "caf\u{00e9}";
        let decomposed = "cafe\u{0301}";
        assert_eq!(
            requirement_checksum(composed),
            requirement_checksum(decomposed)
        );
    }

    #[test]
    fn checksum_differs_for_different_titles() {
        assert_ne!(
            requirement_checksum("The system shall log in users"),
            requirement_checksum("The system shall log out users")
        );
    }
}
