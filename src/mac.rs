//! Keyed MAC folding.
//!
//! Every volume MAC — block tails, name integrity, chained IVs — reduces to
//! the same HMAC-SHA1 digest folded down to 8, 4, or 2 bytes. The fold only
//! consumes 19 of the 20 digest bytes; that's not a bug, it's the original
//! EncFS behavior and changing it breaks bit-compatibility with every
//! existing volume, so it stays exactly as captured here.

use crate::primitives;

/// Folds an HMAC-SHA1 digest of `data` down to 8 bytes. Only the first 19 of
/// the 20 digest bytes are folded in (not 20) — preserved for on-disk
/// compatibility, do not "fix".
pub fn mac64(hmac_key: &[u8], data: &[u8]) -> [u8; 8] {
    let digest = primitives::hmac_sha1(hmac_key, data);
    let mut mac = [0u8; 8];
    for i in 0..19 {
        mac[i % 8] ^= digest[i];
    }
    mac
}

/// `mac64` over `data` with an 8-byte chain value appended in reverse byte
/// order. Used everywhere a MAC needs to be bound to a running chain (chained
/// name IVs, block sequencing).
pub fn mac64_with_chain(hmac_key: &[u8], data: &[u8], chain: &[u8; 8]) -> [u8; 8] {
    let mut concat = Vec::with_capacity(data.len() + 8);
    concat.extend_from_slice(data);
    for i in 0..8 {
        concat.push(chain[7 - i]);
    }
    mac64(hmac_key, &concat)
}

pub fn mac32(hmac_key: &[u8], data: &[u8]) -> [u8; 4] {
    let mac8 = mac64(hmac_key, data);
    fold64_to_32(&mac8)
}

pub fn mac32_with_chain(hmac_key: &[u8], data: &[u8], chain: &[u8; 8]) -> [u8; 4] {
    let mac8 = mac64_with_chain(hmac_key, data, chain);
    fold64_to_32(&mac8)
}

pub fn mac16(hmac_key: &[u8], data: &[u8]) -> [u8; 2] {
    let mac4 = mac32(hmac_key, data);
    fold32_to_16(&mac4)
}

pub fn mac16_with_chain(hmac_key: &[u8], data: &[u8], chain: &[u8; 8]) -> [u8; 2] {
    let mac4 = mac32_with_chain(hmac_key, data, chain);
    fold32_to_16(&mac4)
}

fn fold64_to_32(mac8: &[u8; 8]) -> [u8; 4] {
    [
        mac8[4] ^ mac8[0],
        mac8[5] ^ mac8[1],
        mac8[6] ^ mac8[2],
        mac8[7] ^ mac8[3],
    ]
}

fn fold32_to_16(mac4: &[u8; 4]) -> [u8; 2] {
    [mac4[2] ^ mac4[0], mac4[3] ^ mac4[1]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_are_deterministic() {
        let key = b"a volume hmac key, arbitrary length";
        let data = b"some block of ciphertext bytes";
        assert_eq!(mac64(key, data), mac64(key, data));
        assert_eq!(mac32(key, data), mac32(key, data));
        assert_eq!(mac16(key, data), mac16(key, data));
    }

    #[test]
    fn chain_changes_the_fold() {
        let key = b"a volume hmac key, arbitrary length";
        let data = b"identical payload bytes";
        let c1 = [0u8; 8];
        let mut c2 = [0u8; 8];
        c2[0] = 1;
        assert_ne!(mac64_with_chain(key, data, &c1), mac64_with_chain(key, data, &c2));
    }

    #[test]
    fn narrower_folds_are_xors_of_the_wider_one() {
        let key = b"key material";
        let data = b"payload";
        let mac8 = mac64(key, data);
        let mac4 = mac32(key, data);
        assert_eq!(mac4, fold64_to_32(&mac8));
        let mac2 = mac16(key, data);
        assert_eq!(mac2, fold32_to_16(&mac4));
    }
}
