//! Name codec: per-component filename encryption, full-path encode/decode,
//! and cloud-sync conflict-suffix reconciliation.

use tracing::debug;

use crate::error::{Result, VolumeError};
use crate::iv;
use crate::mac;
use crate::primitives::{self, BLOCK_SIZE};

/// Pads `data` to a 16-byte multiple, PKCS#7 style. An already-aligned input
/// still gets a full 16-byte block of padding — this is intentional, not an
/// off-by-one; a zero-length pad is never emitted.
pub fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad_len = match data.len() % BLOCK_SIZE {
        0 => BLOCK_SIZE,
        r => BLOCK_SIZE - r,
    };
    let mut out = Vec::with_capacity(data.len() + pad_len);
    out.extend_from_slice(data);
    out.resize(out.len() + pad_len, pad_len as u8);
    out
}

pub fn pkcs7_unpad(data: &[u8]) -> Result<Vec<u8>> {
    let pad_len = *data
        .last()
        .ok_or_else(|| VolumeError::InvalidBlock("empty padded name".into()))? as usize;
    if pad_len == 0 || pad_len > BLOCK_SIZE || pad_len > data.len() {
        return Err(VolumeError::InvalidBlock("bad PKCS#7 pad length".into()));
    }
    let pad_start = data.len() - pad_len;
    if !data[pad_start..].iter().all(|&b| b as usize == pad_len) {
        return Err(VolumeError::InvalidBlock("inconsistent PKCS#7 padding".into()));
    }
    Ok(data[..pad_start].to_vec())
}

/// Folds a chain IV over every non-empty component of `path`, in order.
pub fn chain_iv_over_path(volume_key: &[u8], path: &str) -> [u8; 8] {
    let mut chain = [0u8; 8];
    for component in path.split('/').filter(|c| !c.is_empty()) {
        let padded = pkcs7_pad(component.as_bytes());
        chain = mac::mac64_with_chain(volume_key, &padded, &chain);
    }
    chain
}

fn per_name_seed(chain_iv: &[u8; 8], name_mac: &[u8; 2]) -> [u8; 8] {
    let mut seed = [0u8; 8];
    seed[..6].copy_from_slice(&chain_iv[..6]);
    seed[6] = chain_iv[6] ^ name_mac[0];
    seed[7] = chain_iv[7] ^ name_mac[1];
    seed
}

/// Encodes one path component and appends the result to `out`. `.` and `..`
/// pass through unchanged. `parent_plain_dir` is the plaintext path of the
/// containing directory, used only when `chained_name_iv` is set.
pub fn encode_name(
    volume_key: &[u8],
    volume_iv: &[u8; BLOCK_SIZE],
    chained_name_iv: bool,
    name: &str,
    parent_plain_dir: &str,
    out: &mut String,
) -> Result<()> {
    if name == "." || name == ".." {
        out.push_str(name);
        return Ok(());
    }
    let padded = pkcs7_pad(name.as_bytes());
    let chain_iv = if chained_name_iv {
        chain_iv_over_path(volume_key, parent_plain_dir)
    } else {
        [0u8; 8]
    };
    let name_mac = if chained_name_iv {
        mac::mac16_with_chain(volume_key, &padded, &chain_iv)
    } else {
        mac::mac16(volume_key, &padded)
    };
    let seed = per_name_seed(&chain_iv, &name_mac);
    let name_iv = iv::generate_iv_seed8(volume_key, volume_iv, &seed);
    let ciphertext = primitives::cbc_encrypt(volume_key, &name_iv, &padded)?;

    let mut blob = Vec::with_capacity(2 + ciphertext.len());
    blob.extend_from_slice(&name_mac);
    blob.extend_from_slice(&ciphertext);
    primitives::encode_name_b64(&blob, out);
    Ok(())
}

/// Decodes one path component and appends the result to `out`. Does not
/// attempt conflict-suffix recovery — that's `decode_path`'s job, since it
/// needs to retry with the stripped core name.
pub fn decode_name(
    volume_key: &[u8],
    volume_iv: &[u8; BLOCK_SIZE],
    chained_name_iv: bool,
    encoded: &str,
    parent_plain_dir: &str,
    out: &mut String,
) -> Result<()> {
    if encoded == "." || encoded == ".." {
        out.push_str(encoded);
        return Ok(());
    }
    let mut blob = Vec::new();
    primitives::decode_name_b64(encoded, &mut blob)?;
    if blob.len() < 2 {
        return Err(VolumeError::InvalidBlock("truncated encoded name".into()));
    }
    let (mac_bytes, ciphertext) = blob.split_at(2);
    let mut carried_mac = [0u8; 2];
    carried_mac.copy_from_slice(mac_bytes);

    let chain_iv = if chained_name_iv {
        chain_iv_over_path(volume_key, parent_plain_dir)
    } else {
        [0u8; 8]
    };
    let seed = per_name_seed(&chain_iv, &carried_mac);
    let name_iv = iv::generate_iv_seed8(volume_key, volume_iv, &seed);
    let padded = primitives::cbc_decrypt(volume_key, &name_iv, ciphertext)?;

    let computed_mac = if chained_name_iv {
        mac::mac16_with_chain(volume_key, &padded, &chain_iv)
    } else {
        mac::mac16(volume_key, &padded)
    };
    if !primitives::constant_time_eq(&computed_mac, &carried_mac) {
        return Err(VolumeError::InvalidBlock("name MAC mismatch".into()));
    }
    let name_bytes = pkcs7_unpad(&padded)?;
    let name = String::from_utf8(name_bytes)
        .map_err(|_| VolumeError::InvalidBlock("decoded name is not valid UTF-8".into()))?;
    out.push_str(&name);
    Ok(())
}

fn leaf_and_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[i + 1..], &path[..i]),
        None => (path, ""),
    }
}

/// Encodes every component of `plain_path` in order, threading the
/// plaintext-so-far as chain-IV input for the next component.
pub fn encode_path(volume_key: &[u8], volume_iv: &[u8; BLOCK_SIZE], chained_name_iv: bool, plain_path: &str) -> Result<String> {
    let mut out_parts = Vec::new();
    let mut parent = String::new();
    for component in plain_path.split('/').filter(|c| !c.is_empty()) {
        let mut encoded = String::new();
        encode_name(volume_key, volume_iv, chained_name_iv, component, &parent, &mut encoded)?;
        out_parts.push(encoded);
        if !parent.is_empty() {
            parent.push('/');
        }
        parent.push_str(component);
    }
    Ok(out_parts.join("/"))
}

/// Decodes every component of `cipher_path`. When `!chained_name_iv`, a
/// component that fails normal decode gets one retry after stripping a
/// recognized cloud-sync conflict suffix.
pub fn decode_path(volume_key: &[u8], volume_iv: &[u8; BLOCK_SIZE], chained_name_iv: bool, cipher_path: &str) -> Result<String> {
    let mut out_parts = Vec::new();
    let mut parent = String::new();
    for component in cipher_path.split('/').filter(|c| !c.is_empty()) {
        let mut decoded = String::new();
        let first_try = decode_name(volume_key, volume_iv, chained_name_iv, component, &parent, &mut decoded);
        if first_try.is_err() {
            if chained_name_iv {
                first_try?;
            }
            match try_extract_cloud_conflict_suffix(component) {
                Some((core, suffix)) => {
                    debug!(component, suffix, "retrying decode after stripping cloud-sync conflict suffix");
                    let mut core_decoded = String::new();
                    decode_name(volume_key, volume_iv, chained_name_iv, &core, &parent, &mut core_decoded)?;
                    decoded = insert_conflict_suffix(&core_decoded, &suffix);
                }
                None => {
                    first_try?;
                }
            }
        }
        out_parts.push(decoded.clone());
        if !parent.is_empty() {
            parent.push('/');
        }
        parent.push_str(&decoded);
    }
    Ok(out_parts.join("/"))
}

/// `encode_path`, with an opt-in retry: if the straightforwardly-encoded
/// path doesn't exist on disk (per `file_exists`) and the plaintext leaf
/// carries a recognizable cloud-sync conflict suffix, re-encodes the core
/// leaf name and reattaches the original suffix text.
pub fn encode_path_checking_conflicts(
    volume_key: &[u8],
    volume_iv: &[u8; BLOCK_SIZE],
    chained_name_iv: bool,
    plain_path: &str,
    file_exists: impl Fn(&str) -> bool,
) -> Result<String> {
    let encoded = encode_path(volume_key, volume_iv, chained_name_iv, plain_path)?;
    if file_exists(&encoded) || chained_name_iv {
        return Ok(encoded);
    }
    let (leaf, parent_plain) = leaf_and_parent(plain_path);
    if let Some((core, suffix)) = try_extract_cloud_conflict_suffix(leaf) {
        let mut enc_leaf = String::new();
        encode_name(volume_key, volume_iv, chained_name_iv, &core, parent_plain, &mut enc_leaf)?;
        let (_, enc_parent) = leaf_and_parent(&encoded);
        let rebuilt = if enc_parent.is_empty() {
            format!("{enc_leaf}{suffix}")
        } else {
            format!("{enc_parent}/{enc_leaf}{suffix}")
        };
        return Ok(rebuilt);
    }
    Ok(encoded)
}

/// Tries Dropbox-style, then Google-Drive-style conflict markers, in that
/// order. Returns `(core, suffix)` where `core ++ suffix == name`.
pub fn try_extract_cloud_conflict_suffix(name: &str) -> Option<(String, String)> {
    extract_dropbox_conflict(name).or_else(|| extract_google_drive_conflict(name))
}

/// `"report (user's conflicted copy 2024-01-01).txt"`-style marker: the last
/// parenthesized group, whose content mentions "conflict", anchored at the
/// very end of the (extension-stripped) name.
fn extract_dropbox_conflict(name: &str) -> Option<(String, String)> {
    let open = name.rfind('(')?;
    if open == 0 {
        return None;
    }
    let close = open + name[open..].find(')')?;
    let content = &name[open + 1..close];
    if !content.to_ascii_lowercase().contains("conflict") {
        return None;
    }
    let mut core_end = open;
    if core_end > 0 && name.as_bytes()[core_end - 1] == b' ' {
        core_end -= 1;
    }
    let core = name[..core_end].trim_end_matches(' ').to_string();
    let suffix = name[core_end..].to_string();
    Some((core, suffix))
}

/// `"report_conf(3)"`-style marker: a trailing `_conf(N)` with a digits-only
/// `N`.
fn extract_google_drive_conflict(name: &str) -> Option<(String, String)> {
    const MARKER: &str = "_conf(";
    let start = name.rfind(MARKER)?;
    let open = start + MARKER.len() - 1;
    let close = open + name[open..].find(')')?;
    let digits = &name[open + 1..close];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((name[..start].to_string(), name[start..].to_string()))
}

/// Reinserts `suffix` before the last `.` in `decoded` (unless it's at
/// position 0), else appends it at the end.
pub fn insert_conflict_suffix(decoded: &str, suffix: &str) -> String {
    match decoded.rfind('.') {
        Some(dot) if dot != 0 => {
            let mut s = String::with_capacity(decoded.len() + suffix.len());
            s.push_str(&decoded[..dot]);
            s.push_str(suffix);
            s.push_str(&decoded[dot..]);
            s
        }
        _ => format!("{decoded}{suffix}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_and_iv() -> (Vec<u8>, [u8; BLOCK_SIZE]) {
        (vec![0x5au8; 32], [0x7bu8; BLOCK_SIZE])
    }

    #[test]
    fn pkcs7_round_trips_including_exact_block_multiples() {
        for len in [0, 1, 15, 16, 17, 32] {
            let data = vec![0x42u8; len];
            let padded = pkcs7_pad(&data);
            assert_eq!(padded.len() % BLOCK_SIZE, 0);
            assert!(padded.len() > data.len() || len == 0 && padded.len() == BLOCK_SIZE);
            assert_eq!(pkcs7_unpad(&padded).unwrap(), data);
        }
    }

    #[test]
    fn name_round_trips_unchained() {
        let (key, iv) = key_and_iv();
        let mut enc = String::new();
        encode_name(&key, &iv, false, "secret-report.txt", "", &mut enc).unwrap();
        let mut dec = String::new();
        decode_name(&key, &iv, false, &enc, "", &mut dec).unwrap();
        assert_eq!(dec, "secret-report.txt");
    }

    #[test]
    fn name_round_trips_chained_and_depends_on_parent() {
        let (key, iv) = key_and_iv();
        let mut enc_a = String::new();
        encode_name(&key, &iv, true, "leaf.txt", "dirA", &mut enc_a).unwrap();
        let mut enc_b = String::new();
        encode_name(&key, &iv, true, "leaf.txt", "dirB", &mut enc_b).unwrap();
        assert_ne!(enc_a, enc_b);

        let mut dec = String::new();
        decode_name(&key, &iv, true, &enc_a, "dirA", &mut dec).unwrap();
        assert_eq!(dec, "leaf.txt");
        let mut wrong_parent = String::new();
        assert!(decode_name(&key, &iv, true, &enc_a, "dirB", &mut wrong_parent).is_err());
    }

    #[test]
    fn dotted_components_pass_through() {
        let (key, iv) = key_and_iv();
        let mut enc = String::new();
        encode_name(&key, &iv, false, ".", "", &mut enc).unwrap();
        assert_eq!(enc, ".");
    }

    #[test]
    fn full_path_round_trips() {
        let (key, iv) = key_and_iv();
        let encoded = encode_path(&key, &iv, false, "docs/2024/report.txt").unwrap();
        let decoded = decode_path(&key, &iv, false, &encoded).unwrap();
        assert_eq!(decoded, "docs/2024/report.txt");
    }

    #[test]
    fn tampered_name_mac_is_rejected() {
        let (key, iv) = key_and_iv();
        let mut enc = String::new();
        encode_name(&key, &iv, false, "file.txt", "", &mut enc).unwrap();
        let mut bytes: Vec<char> = enc.chars().collect();
        bytes[0] = if bytes[0] == 'A' { 'B' } else { 'A' };
        let tampered: String = bytes.into_iter().collect();
        let mut dec = String::new();
        assert!(decode_name(&key, &iv, false, &tampered, "", &mut dec).is_err());
    }

    #[test]
    fn dropbox_conflict_suffix_is_recognized() {
        let (core, suffix) = extract_dropbox_conflict("report (John's conflicted copy 2024-01-01).txt").unwrap();
        assert_eq!(core, "report.txt".replace(".txt", ""));
        assert!(suffix.to_ascii_lowercase().contains("conflict"));
    }

    #[test]
    fn google_drive_conflict_suffix_is_recognized() {
        let (core, suffix) = extract_google_drive_conflict("report_conf(3)").unwrap();
        assert_eq!(core, "report");
        assert_eq!(suffix, "_conf(3)");
    }

    #[test]
    fn non_conflict_parens_are_not_matched() {
        assert!(extract_dropbox_conflict("my (draft).txt").is_none());
        assert!(extract_google_drive_conflict("plain_conf(abc)").is_none());
    }

    #[test]
    fn decode_path_recovers_dropbox_conflict_suffix() {
        let (key, iv) = key_and_iv();
        let encoded = encode_path(&key, &iv, false, "docs/report.txt").unwrap();
        let synced = format!("{encoded} (conflicted copy 2024-01-01)");
        let decoded = decode_path(&key, &iv, false, &synced).unwrap();
        assert_eq!(decoded, "docs/report (conflicted copy 2024-01-01).txt");
    }

    #[test]
    fn decode_path_recovers_google_drive_conflict_suffix() {
        let (key, iv) = key_and_iv();
        let encoded = encode_path(&key, &iv, false, "notes.md").unwrap();
        let synced = format!("{encoded}_conf(2)");
        let decoded = decode_path(&key, &iv, false, &synced).unwrap();
        assert_eq!(decoded, "notes_conf(2).md");
    }

    #[test]
    fn insert_conflict_suffix_prefers_before_extension() {
        assert_eq!(insert_conflict_suffix("report.txt", " (conflict)"), "report (conflict).txt");
        assert_eq!(insert_conflict_suffix("README", "_conf(2)"), "README_conf(2)");
        assert_eq!(insert_conflict_suffix(".hidden", "_conf(2)"), ".hidden_conf(2)");
    }
}
