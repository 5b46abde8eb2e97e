use std::io::Cursor;

use murmur3::murmur3_x64_128;
use sha2::{Digest, Sha256};

use crate::records::BannerHashes;

/// Shingle width used for simhash tokenization. Four bytes is wide enough to
/// capture protocol tokens ("SSH-", "HTTP", "220 ") while keeping short
/// banners from collapsing into a single feature.
const SHINGLE_WIDTH: usize = 4;

const SIMHASH_SEED: u32 = 0;

/// Compute the full hash tuple for one captured banner.
pub fn fingerprint(data: &[u8]) -> BannerHashes {
    BannerHashes {
        md5: md5_hex(data),
        sha256: sha256_hex(data),
        simhash: simhash(data),
    }
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// 64-bit similarity-preserving fingerprint over byte shingles.
///
/// Each `SHINGLE_WIDTH`-byte window is hashed with murmur3; per bit position
/// the counts of set/unset bits across all shingles are accumulated and
/// thresholded. Hamming distance between two simhashes approximates how much
/// of the shingle set two banners share. Empty input maps to 0.
pub fn simhash(data: &[u8]) -> u64 {
    if data.is_empty() {
        return 0;
    }

    let mut weights = [0i64; 64];
    let mut shingle = |bytes: &[u8]| {
        let h = murmur3_x64_128(&mut Cursor::new(bytes), SIMHASH_SEED).unwrap_or_default() as u64;
        for (bit, weight) in weights.iter_mut().enumerate() {
            if h >> bit & 1 == 1 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    };

    if data.len() <= SHINGLE_WIDTH {
        shingle(data);
    } else {
        for window in data.windows(SHINGLE_WIDTH) {
            shingle(window);
        }
    }

    let mut out = 0u64;
    for (bit, weight) in weights.iter().enumerate() {
        if *weight > 0 {
            out |= 1 << bit;
        }
    }
    out
}

/// Number of differing bits between two simhashes.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_md5_digest() {
        // Well-known reference vector.
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            md5_hex(b"HTTP/1.1 200 OK\r\nServer: nginx/1.18.0\r\n\r\n"),
            format!("{:x}", md5::compute(b"HTTP/1.1 200 OK\r\nServer: nginx/1.18.0\r\n\r\n"))
        );
    }

    #[test]
    fn known_sha256_digest() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let data = b"220 mail.example.com ESMTP Postfix (Ubuntu)";
        let a = fingerprint(data);
        let b = fingerprint(data);
        assert_eq!(a, b);
        assert_ne!(a.simhash, 0);
    }

    #[test]
    fn simhash_of_empty_input_is_zero() {
        assert_eq!(simhash(b""), 0);
    }

    #[test]
    fn similar_banners_have_close_simhashes() {
        let a = simhash(b"HTTP/1.1 200 OK\r\nServer: nginx/1.18.0\r\nContent-Type: text/html\r\n\r\n");
        let b = simhash(b"HTTP/1.1 200 OK\r\nServer: nginx/1.19.2\r\nContent-Type: text/html\r\n\r\n");
        assert!(hamming_distance(a, b) <= 20, "distance {}", hamming_distance(a, b));
    }

    #[test]
    fn unrelated_banners_have_distant_simhashes() {
        let a = simhash(b"HTTP/1.1 200 OK\r\nServer: nginx/1.18.0\r\nContent-Type: text/html\r\n\r\n");
        let b = simhash(b"SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.6");
        assert!(hamming_distance(a, b) > 20, "distance {}", hamming_distance(a, b));
    }

    #[test]
    fn short_input_still_produces_a_signature() {
        assert_ne!(simhash(b"ab"), 0);
        assert_eq!(simhash(b"ab"), simhash(b"ab"));
    }
}
