//! Lowest-level cryptographic building blocks.
//!
//! Everything here operates on raw byte slices and single AES blocks — no
//! volume-level concepts (IVs, chaining, MACs) live in this module. Block
//! chaining is done by hand rather than through `cbc`/`cfb-mode` crates: the
//! stream codec's shuffle/flip/shuffle pipeline (see `crate::block`) needs to
//! reach in between cipher steps, which a canned mode type would only get in
//! the way of.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::PrimitiveError;

pub const BLOCK_SIZE: usize = 16;

/// The custom alphabet EncFS uses for its block-codec file names. Comma
/// first, then dash, digits, uppercase, lowercase: 64 entries.
const ALPHABET: &[u8; 64] =
    b",-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Reverse lookup, built once. `-1` marks a byte that isn't in the alphabet.
fn reverse_lookup() -> [i16; 256] {
    let mut table = [-1i16; 256];
    for (value, &ch) in ALPHABET.iter().enumerate() {
        table[ch as usize] = value as i16;
    }
    table
}

/// Dispatches over the three AES key sizes EncFS volumes may use.
enum AesKey {
    Aes128(Box<Aes128>),
    Aes192(Box<Aes192>),
    Aes256(Box<Aes256>),
}

impl AesKey {
    fn new(key: &[u8]) -> Result<Self, PrimitiveError> {
        match key.len() {
            16 => Ok(AesKey::Aes128(Box::new(
                Aes128::new_from_slice(key).expect("length already checked above"),
            ))),
            24 => Ok(AesKey::Aes192(Box::new(
                Aes192::new_from_slice(key).expect("length already checked above"),
            ))),
            32 => Ok(AesKey::Aes256(Box::new(
                Aes256::new_from_slice(key).expect("length already checked above"),
            ))),
            n => Err(PrimitiveError::BadKeyLength(n)),
        }
    }

    fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        let b = (*block).into();
        let mut b = b;
        match self {
            AesKey::Aes128(k) => k.encrypt_block(&mut b),
            AesKey::Aes192(k) => k.encrypt_block(&mut b),
            AesKey::Aes256(k) => k.encrypt_block(&mut b),
        }
        block.copy_from_slice(&b);
    }

    fn decrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        let b = (*block).into();
        let mut b = b;
        match self {
            AesKey::Aes128(k) => k.decrypt_block(&mut b),
            AesKey::Aes192(k) => k.decrypt_block(&mut b),
            AesKey::Aes256(k) => k.decrypt_block(&mut b),
        }
        block.copy_from_slice(&b);
    }
}

/// AES-CBC over `data` with zero padding to a block boundary. `data.len()`
/// need not already be block-aligned; the caller is responsible for treating
/// any padding bytes appropriately on decode (EncFS volumes always encode
/// data whose length is already known out of band, so the zero padding is
/// never misread as content).
pub fn cbc_encrypt(key: &[u8], iv: &[u8; BLOCK_SIZE], data: &[u8]) -> Result<Vec<u8>, PrimitiveError> {
    let cipher = AesKey::new(key)?;
    let mut out = Vec::with_capacity(data.len() + BLOCK_SIZE);
    let mut prev = *iv;
    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        for i in 0..BLOCK_SIZE {
            block[i] ^= prev[i];
        }
        cipher.encrypt_block(&mut block);
        out.extend_from_slice(&block);
        prev = block;
    }
    out.truncate(data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE);
    Ok(out)
}

pub fn cbc_decrypt(key: &[u8], iv: &[u8; BLOCK_SIZE], data: &[u8]) -> Result<Vec<u8>, PrimitiveError> {
    let cipher = AesKey::new(key)?;
    let mut out = Vec::with_capacity(data.len());
    let mut prev = *iv;
    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        let cipher_block = block;
        cipher.decrypt_block(&mut block);
        for i in 0..BLOCK_SIZE {
            block[i] ^= prev[i];
        }
        out.extend_from_slice(&block[..chunk.len()]);
        prev = cipher_block;
    }
    Ok(out)
}

/// AES-CFB (full 16-byte feedback, zero-padded final segment) over `data`.
/// Used by the stream codec, never directly by callers outside this crate's
/// `block`/`handle` modules.
pub fn cfb_encrypt(key: &[u8], iv: &[u8; BLOCK_SIZE], data: &[u8]) -> Result<Vec<u8>, PrimitiveError> {
    let cipher = AesKey::new(key)?;
    let mut out = Vec::with_capacity(data.len());
    let mut register = *iv;
    for chunk in data.chunks(BLOCK_SIZE) {
        let mut keystream = register;
        cipher.encrypt_block(&mut keystream);
        let mut block = [0u8; BLOCK_SIZE];
        for (i, &b) in chunk.iter().enumerate() {
            block[i] = b ^ keystream[i];
        }
        out.extend_from_slice(&block[..chunk.len()]);
        register = block;
    }
    Ok(out)
}

pub fn cfb_decrypt(key: &[u8], iv: &[u8; BLOCK_SIZE], data: &[u8]) -> Result<Vec<u8>, PrimitiveError> {
    let cipher = AesKey::new(key)?;
    let mut out = Vec::with_capacity(data.len());
    let mut register = *iv;
    for chunk in data.chunks(BLOCK_SIZE) {
        let mut keystream = register;
        cipher.encrypt_block(&mut keystream);
        let mut cipher_block = [0u8; BLOCK_SIZE];
        cipher_block[..chunk.len()].copy_from_slice(chunk);
        let mut plain = [0u8; BLOCK_SIZE];
        for i in 0..chunk.len() {
            plain[i] = chunk[i] ^ keystream[i];
        }
        out.extend_from_slice(&plain[..chunk.len()]);
        register = cipher_block;
    }
    Ok(out)
}

type HmacSha1 = Hmac<Sha1>;

/// One-shot HMAC-SHA1, 20-byte digest.
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 20];
    out.copy_from_slice(&result);
    out
}

/// PBKDF2-HMAC-SHA1 passphrase stretching, as used for the volume key KDF.
pub fn pbkdf2_hmac_sha1(passphrase: &[u8], salt: &[u8], iterations: u32, out_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; out_len];
    pbkdf2::pbkdf2::<HmacSha1>(passphrase, salt, iterations, &mut out)
        .expect("pbkdf2 output length is always valid for HMAC-SHA1");
    out
}

/// Constant-time equality, used for every MAC and key comparison in the
/// volume so that timing never reveals which prefix first diverged.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

pub fn be_u32(bytes: &[u8]) -> u32 {
    let mut b = [0u8; 4];
    let n = bytes.len().min(4);
    b[4 - n..].copy_from_slice(&bytes[..n]);
    u32::from_be_bytes(b)
}

pub fn be_u64(bytes: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    let n = bytes.len().min(8);
    b[8 - n..].copy_from_slice(&bytes[..n]);
    u64::from_be_bytes(b)
}

pub fn u32_be_bytes(v: u32) -> [u8; 4] {
    v.to_be_bytes()
}

pub fn u64_be_bytes(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

/// Appends the base64 encoding of `input` onto `out`. Never clears `out`
/// first — callers build encoded paths component by component.
pub fn encode_name_b64(input: &[u8], out: &mut String) {
    let mut work: u32 = 0;
    let mut working_bits = 0u32;
    let mut raw = Vec::with_capacity(input.len() * 8 / 6 + 1);
    for &byte in input {
        work |= (byte as u32) << working_bits;
        working_bits += 8;
        while working_bits > 6 {
            raw.push((work & 0x3f) as u8);
            work >>= 6;
            working_bits -= 6;
        }
    }
    if working_bits > 0 {
        raw.push((work & 0x3f) as u8);
    }
    out.reserve(raw.len());
    for v in raw {
        out.push(ALPHABET[v as usize] as char);
    }
}

/// Appends the decoded bytes of `input` onto `out`. Fails if `input`
/// contains a character outside the name-codec alphabet. Never clears `out`
/// first, matching the encode side.
pub fn decode_name_b64(input: &str, out: &mut Vec<u8>) -> Result<(), PrimitiveError> {
    let lookup = reverse_lookup();
    let mut work: u32 = 0;
    let mut work_bits = 0u32;
    for ch in input.bytes() {
        let v = lookup[ch as usize];
        if v < 0 {
            return Err(PrimitiveError::InvalidBase64Char);
        }
        work |= (v as u32) << work_bits;
        work_bits += 6;
        while work_bits >= 8 {
            out.push((work & 0xff) as u8);
            work >>= 8;
            work_bits -= 8;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbc_round_trips() {
        let key = [0x11u8; 16];
        let iv = [0x22u8; BLOCK_SIZE];
        let data = b"a somewhat odd length input!!";
        let ct = cbc_encrypt(&key, &iv, data).unwrap();
        let pt = cbc_decrypt(&key, &iv, &ct).unwrap();
        assert_eq!(&pt[..data.len()], &data[..]);
    }

    #[test]
    fn cfb_round_trips_arbitrary_length() {
        let key = [0x33u8; 24];
        let iv = [0x44u8; BLOCK_SIZE];
        let data = b"x";
        let ct = cfb_encrypt(&key, &iv, data).unwrap();
        let pt = cfb_decrypt(&key, &iv, &ct).unwrap();
        assert_eq!(pt, data);

        let longer = b"exactly a two block run!";
        let ct2 = cfb_encrypt(&key, &iv, longer).unwrap();
        let pt2 = cfb_decrypt(&key, &iv, &ct2).unwrap();
        assert_eq!(pt2, longer);
    }

    #[test]
    fn name_b64_round_trips_and_appends() {
        let mut encoded = String::from("prefix-");
        encode_name_b64(b"hello world", &mut encoded);
        assert!(encoded.starts_with("prefix-"));

        let mut decoded = vec![0xAA];
        decode_name_b64(&encoded[7..], &mut decoded).unwrap();
        assert_eq!(&decoded[1..], b"hello world");
    }

    #[test]
    fn name_b64_rejects_foreign_chars() {
        let mut out = Vec::new();
        assert!(decode_name_b64("not_valid!", &mut out).is_err());
    }

    #[test]
    fn alphabet_has_64_unique_entries() {
        let mut seen = std::collections::HashSet::new();
        for &b in ALPHABET {
            assert!(seen.insert(b), "duplicate alphabet byte {b}");
        }
        assert_eq!(ALPHABET.len(), 64);
    }

    #[test]
    fn hmac_sha1_matches_known_vector() {
        // RFC 2202 test case 1.
        let key = [0x0bu8; 20];
        let data = b"Hi There";
        let mac = hmac_sha1(&key, data);
        assert_eq!(hex_encode(&mac), "b617318655057264e28bc0b6fb378c8ef146be00");
    }

    fn hex_encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}
