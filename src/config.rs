//! Volume configuration: the EncFS 6 descriptor codec and volume-key
//! wrap/unwrap.

use std::collections::HashMap;
use std::io::Cursor;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tracing::{instrument, warn};
use zeroize::Zeroize;

use crate::block;
use crate::error::{Result, VolumeError};
use crate::mac;
use crate::primitives::{self, BLOCK_SIZE};

const ROOT_ELEMENT: &str = "encfsConfig";
const CIPHER_ALG: &str = "ssl/aes 3.0";
const NAME_ALG: &str = "nameio/block 3.0";

/// Which default parameter table `create` should draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Standard,
    Paranoia,
}

/// The EncFS 6 volume descriptor. Immutable once loaded — reverse-mode field
/// overrides are applied during `from_xml`/`create`, not mutated later.
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    pub key_size_bits: u32,
    pub block_size: u32,
    pub unique_iv: bool,
    pub chained_name_iv: bool,
    pub external_iv_chaining: bool,
    pub block_mac_bytes: u32,
    pub block_mac_rand_bytes: u32,
    pub allow_holes: bool,
    pub salt: Vec<u8>,
    pub kdf_iterations: u32,
    pub desired_kdf_duration: u32,
    /// 4-byte MAC seed ∥ encrypted volume-key-and-IV bytes, already
    /// Base64-decoded from the descriptor's `encodedKeyData` element.
    pub encoded_key_data: Vec<u8>,
    pub reverse: bool,
}

/// The decrypted volume secrets. `Zeroize`s its key material on drop.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct UnlockedVolume {
    pub volume_key: Vec<u8>,
    pub volume_iv: [u8; BLOCK_SIZE],
}

impl VolumeConfig {
    pub fn from_xml(xml: &str) -> Result<Self> {
        let fields = parse_fields(xml)?;
        let get = |name: &str| -> Result<&String> {
            fields
                .get(name)
                .ok_or_else(|| VolumeError::BadConfiguration(format!("missing field {name}")))
        };
        let parse_u32 = |name: &str| -> Result<u32> {
            get(name)?
                .trim()
                .parse::<u32>()
                .map_err(|_| VolumeError::BadConfiguration(format!("bad integer in {name}")))
        };
        let parse_bool = |name: &str| -> Result<bool> { Ok(parse_u32(name)? != 0) };

        let cipher_alg = get("cipherAlg")?;
        if cipher_alg != CIPHER_ALG {
            return Err(VolumeError::BadConfiguration(format!(
                "unsupported cipherAlg {cipher_alg}"
            )));
        }
        let name_alg = get("nameAlg")?;
        if name_alg != NAME_ALG {
            return Err(VolumeError::BadConfiguration(format!(
                "unsupported nameAlg {name_alg}"
            )));
        }

        let salt = base64::decode(get("saltData")?.trim())
            .map_err(|e| VolumeError::BadConfiguration(format!("bad saltData: {e}")))?;
        let encoded_key_data = base64::decode(get("encodedKeyData")?.trim())
            .map_err(|e| VolumeError::BadConfiguration(format!("bad encodedKeyData: {e}")))?;

        let reverse = fields
            .get("reverse")
            .map(|v| v.trim() != "0")
            .unwrap_or(false);

        let mut cfg = VolumeConfig {
            key_size_bits: parse_u32("keySize")?,
            block_size: parse_u32("blockSize")?,
            unique_iv: parse_bool("uniqueIV")?,
            chained_name_iv: parse_bool("chainedNameIV")?,
            external_iv_chaining: parse_bool("externalIVChaining")?,
            block_mac_bytes: parse_u32("blockMACBytes")?,
            block_mac_rand_bytes: parse_u32("blockMACRandBytes")?,
            allow_holes: parse_bool("allowHoles")?,
            salt,
            kdf_iterations: parse_u32("kdfIterations")?,
            desired_kdf_duration: parse_u32("desiredKDFDuration")?,
            encoded_key_data,
            reverse,
        };

        if cfg.reverse {
            // The descriptor is authored for forward mode; reverse mode
            // reinterprets it rather than trusting these fields as written.
            cfg.unique_iv = false;
            cfg.chained_name_iv = false;
            cfg.block_mac_bytes = 0;
            cfg.block_mac_rand_bytes = 0;
        }

        Ok(cfg)
    }

    pub fn to_xml(&self) -> String {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        writer
            .write_event(Event::Start(BytesStart::new(ROOT_ELEMENT)))
            .expect("in-memory writer never fails");

        let fields: &[(&str, String)] = &[
            ("cipherAlg", CIPHER_ALG.to_string()),
            ("nameAlg", NAME_ALG.to_string()),
            ("keySize", self.key_size_bits.to_string()),
            ("blockSize", self.block_size.to_string()),
            ("uniqueIV", bool_str(self.unique_iv)),
            ("chainedNameIV", bool_str(self.chained_name_iv)),
            ("externalIVChaining", bool_str(self.external_iv_chaining)),
            ("blockMACBytes", self.block_mac_bytes.to_string()),
            ("blockMACRandBytes", self.block_mac_rand_bytes.to_string()),
            ("allowHoles", bool_str(self.allow_holes)),
            ("saltData", base64::encode(&self.salt)),
            ("encodedKeyData", base64::encode(&self.encoded_key_data)),
            ("kdfIterations", self.kdf_iterations.to_string()),
            ("desiredKDFDuration", self.desired_kdf_duration.to_string()),
            ("reverse", bool_str(self.reverse)),
        ];
        for (name, value) in fields {
            writer
                .write_event(Event::Start(BytesStart::new(*name)))
                .expect("in-memory writer never fails");
            writer
                .write_event(Event::Text(BytesText::new(value)))
                .expect("in-memory writer never fails");
            writer
                .write_event(Event::End(BytesEnd::new(*name)))
                .expect("in-memory writer never fails");
        }
        writer
            .write_event(Event::End(BytesEnd::new(ROOT_ELEMENT)))
            .expect("in-memory writer never fails");
        String::from_utf8(writer.into_inner().into_inner()).expect("writer only emits UTF-8")
    }

    /// Derives the passphrase key and passphrase IV via PBKDF2-HMAC-SHA1.
    /// Returns `(key, iv)`; `key.len() == key_size_bits/8`.
    pub fn derive_key(&self, passphrase: &[u8]) -> (Vec<u8>, [u8; BLOCK_SIZE]) {
        let key_bytes = (self.key_size_bits / 8) as usize;
        let mut material =
            primitives::pbkdf2_hmac_sha1(passphrase, &self.salt, self.kdf_iterations, key_bytes + BLOCK_SIZE);
        let mut iv = [0u8; BLOCK_SIZE];
        iv.copy_from_slice(&material[key_bytes..]);
        let key = material[..key_bytes].to_vec();
        material.zeroize();
        (key, iv)
    }

    /// Unwraps the volume key under `passphrase`. Errors are always
    /// `UnlockFailed`, regardless of the specific mismatch, so the caller
    /// cannot distinguish a corrupt descriptor from a wrong passphrase.
    #[instrument(skip_all)]
    pub fn unlock(&self, passphrase: &[u8]) -> Result<UnlockedVolume> {
        let (mut pass_key, pass_iv) = self.derive_key(passphrase);
        let result = self.unlock_with(&pass_key, &pass_iv);
        pass_key.zeroize();
        if result.is_err() {
            warn!("volume key unwrap failed: wrong passphrase or corrupt descriptor");
        }
        result
    }

    fn unlock_with(&self, pass_key: &[u8], pass_iv: &[u8; BLOCK_SIZE]) -> Result<UnlockedVolume> {
        if self.encoded_key_data.len() < 4 {
            return Err(VolumeError::UnlockFailed);
        }
        let (seed_bytes, ciphertext) = self.encoded_key_data.split_at(4);
        let mut seed4 = [0u8; 4];
        seed4.copy_from_slice(seed_bytes);

        let mut candidate = block::stream_decrypt_seed4(pass_key, pass_iv, &seed4, ciphertext)
            .map_err(|_| VolumeError::UnlockFailed)?;

        let computed_seed = mac::mac32(pass_key, &candidate);
        let ok = primitives::constant_time_eq(&computed_seed, &seed4);
        if !ok {
            candidate.zeroize();
            return Err(VolumeError::UnlockFailed);
        }

        let key_bytes = (self.key_size_bits / 8) as usize;
        if candidate.len() < key_bytes + BLOCK_SIZE {
            candidate.zeroize();
            return Err(VolumeError::UnlockFailed);
        }
        let volume_key = candidate[..key_bytes].to_vec();
        let mut volume_iv = [0u8; BLOCK_SIZE];
        volume_iv.copy_from_slice(&candidate[key_bytes..key_bytes + BLOCK_SIZE]);
        candidate.zeroize();
        Ok(UnlockedVolume { volume_key, volume_iv })
    }

    /// Creates a fresh volume: random key/IV, wrapped under a freshly
    /// derived passphrase key, descriptor populated with `mode`'s defaults.
    pub fn create(passphrase: &[u8], mode: CreateMode) -> (VolumeConfig, UnlockedVolume) {
        use rand::RngCore;

        let (key_size_bits, chained_name_iv, external_iv_chaining) = match mode {
            CreateMode::Standard => (192u32, false, false),
            CreateMode::Paranoia => (256u32, true, true),
        };
        let key_bytes = (key_size_bits / 8) as usize;

        let mut rng = rand::thread_rng();
        let mut salt = vec![0u8; 20];
        rng.fill_bytes(&mut salt);

        let mut volume_key = vec![0u8; key_bytes];
        rng.fill_bytes(&mut volume_key);
        let mut volume_iv = [0u8; BLOCK_SIZE];
        rng.fill_bytes(&mut volume_iv);

        let mut cfg = VolumeConfig {
            key_size_bits,
            block_size: 1024,
            unique_iv: true,
            chained_name_iv,
            external_iv_chaining,
            block_mac_bytes: 8,
            block_mac_rand_bytes: 0,
            allow_holes: true,
            salt,
            kdf_iterations: 170_203,
            desired_kdf_duration: 500,
            encoded_key_data: Vec::new(),
            reverse: false,
        };

        let (mut pass_key, pass_iv) = cfg.derive_key(passphrase);

        let mut candidate = Vec::with_capacity(key_bytes + BLOCK_SIZE);
        candidate.extend_from_slice(&volume_key);
        candidate.extend_from_slice(&volume_iv);

        let seed4 = mac::mac32(&pass_key, &candidate);
        let encrypted = block::stream_encrypt_seed4(&pass_key, &pass_iv, &seed4, &candidate)
            .expect("passphrase key is always a valid AES key length");
        candidate.zeroize();
        pass_key.zeroize();

        let mut encoded_key_data = Vec::with_capacity(4 + encrypted.len());
        encoded_key_data.extend_from_slice(&seed4);
        encoded_key_data.extend_from_slice(&encrypted);
        cfg.encoded_key_data = encoded_key_data;

        (cfg, UnlockedVolume { volume_key, volume_iv })
    }
}

fn bool_str(b: bool) -> String {
    if b { "1".to_string() } else { "0".to_string() }
}

/// Tokenizes `xml` and collects every leaf element's text content into a
/// flat `name -> value` map. Every field is looked up by name explicitly,
/// and a missing one is a `BadConfiguration`, not a silently-defaulted
/// `Option`.
fn parse_fields(xml: &str) -> Result<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut fields = HashMap::new();
    let mut current: Option<String> = None;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name != ROOT_ELEMENT {
                    current = Some(name);
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(name) = &current {
                    let text = t
                        .unescape()
                        .map_err(|e| VolumeError::BadConfiguration(format!("bad XML text: {e}")))?
                        .into_owned();
                    fields.insert(name.clone(), text);
                }
            }
            Ok(Event::End(_)) => {
                current = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(VolumeError::BadConfiguration(format!("malformed XML: {e}"))),
            _ => {}
        }
        buf.clear();
    }
    Ok(fields)
}

mod base64 {
    use ::base64::engine::general_purpose::STANDARD;
    use ::base64::Engine;

    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    pub fn decode(data: &str) -> Result<Vec<u8>, ::base64::DecodeError> {
        STANDARD.decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_xml_round_trip_preserves_fields() {
        let (cfg, _unlocked) = VolumeConfig::create(b"hunter2", CreateMode::Standard);
        let xml = cfg.to_xml();
        let parsed = VolumeConfig::from_xml(&xml).unwrap();
        assert_eq!(parsed.key_size_bits, cfg.key_size_bits);
        assert_eq!(parsed.block_size, cfg.block_size);
        assert_eq!(parsed.unique_iv, cfg.unique_iv);
        assert_eq!(parsed.chained_name_iv, cfg.chained_name_iv);
        assert_eq!(parsed.salt, cfg.salt);
        assert_eq!(parsed.encoded_key_data, cfg.encoded_key_data);
    }

    #[test]
    fn unlock_succeeds_with_correct_passphrase_only() {
        let (cfg, unlocked) = VolumeConfig::create(b"correct horse battery staple", CreateMode::Paranoia);
        let reopened = cfg.unlock(b"correct horse battery staple").unwrap();
        assert_eq!(reopened.volume_key, unlocked.volume_key);
        assert_eq!(reopened.volume_iv, unlocked.volume_iv);

        let err = cfg.unlock(b"wrong passphrase").unwrap_err();
        assert!(matches!(err, VolumeError::UnlockFailed));
    }

    #[test]
    fn paranoia_mode_turns_on_chaining() {
        let (cfg, _) = VolumeConfig::create(b"x", CreateMode::Paranoia);
        assert_eq!(cfg.key_size_bits, 256);
        assert!(cfg.chained_name_iv);
        assert!(cfg.external_iv_chaining);
    }

    #[test]
    fn reverse_flag_forces_field_overrides_on_load() {
        let (mut cfg, _) = VolumeConfig::create(b"x", CreateMode::Paranoia);
        cfg.reverse = true;
        let xml = cfg.to_xml();
        let parsed = VolumeConfig::from_xml(&xml).unwrap();
        assert!(!parsed.unique_iv);
        assert!(!parsed.chained_name_iv);
        assert_eq!(parsed.block_mac_bytes, 0);
        assert_eq!(parsed.block_mac_rand_bytes, 0);
    }

    #[test]
    fn missing_field_is_bad_configuration() {
        let broken = r#"<encfsConfig><cipherAlg>ssl/aes 3.0</cipherAlg></encfsConfig>"#;
        let err = VolumeConfig::from_xml(broken).unwrap_err();
        assert!(matches!(err, VolumeError::BadConfiguration(_)));
    }
}
