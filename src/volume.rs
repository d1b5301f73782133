//! Volume facade: composes config, crypto primitives, the name and block
//! codecs, and per-handle state behind one type, so a caller never has to
//! juggle `VolumeConfig`/`UnlockedVolume`/`FileHandle`/`HandleRegistry` by
//! hand. This is the single entry point a CLI or test reaches for.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{instrument, warn};

use crate::block::{self, BlockParams};
use crate::config::{CreateMode, UnlockedVolume, VolumeConfig};
use crate::error::{Result, VolumeError};
use crate::handle::registry::HandleRegistry;
use crate::handle::FileHandle;
use crate::name;
use crate::storage::FsBackend;

/// Well-known name of the volume descriptor at the root of an encrypted
/// directory tree, matching upstream EncFS and the reference implementation.
pub const CONFIG_FILE_NAME: &str = ".encfs6.xml";

/// A directory tree encrypted under one EncFS 6 volume. Owns the decrypted
/// volume secrets for its lifetime and the per-path lock registry that
/// serializes size-changing operations across handles opened from it.
pub struct Volume {
    root: PathBuf,
    config: VolumeConfig,
    unlocked: UnlockedVolume,
    registry: HandleRegistry,
}

impl Volume {
    /// Creates a brand-new volume rooted at `root`: writes the descriptor,
    /// generates a fresh volume key/IV, and returns the unlocked handle.
    /// `root` is created if it doesn't already exist.
    #[instrument(skip(passphrase))]
    pub fn create_at(root: impl Into<PathBuf>, passphrase: &[u8], mode: CreateMode) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(VolumeError::WriteError)?;
        let (config, unlocked) = VolumeConfig::create(passphrase, mode);
        fs::write(root.join(CONFIG_FILE_NAME), config.to_xml()).map_err(VolumeError::WriteError)?;
        Ok(Volume { root, config, unlocked, registry: HandleRegistry::new() })
    }

    /// Loads the descriptor at `root` and unlocks it with `passphrase`.
    /// Failure is always [`VolumeError::UnlockFailed`] or
    /// [`VolumeError::BadConfiguration`] — never distinguishable from "wrong
    /// passphrase" by the caller when the descriptor itself parses fine.
    #[instrument(skip(passphrase))]
    pub fn unlock_at(root: impl Into<PathBuf>, passphrase: &[u8]) -> Result<Self> {
        let root = root.into();
        let xml = fs::read_to_string(root.join(CONFIG_FILE_NAME)).map_err(VolumeError::ReadError)?;
        let config = VolumeConfig::from_xml(&xml)?;
        let unlocked = config.unlock(passphrase)?;
        Ok(Volume { root, config, unlocked, registry: HandleRegistry::new() })
    }

    pub fn is_reverse(&self) -> bool {
        self.config.reverse
    }

    fn block_params(&self) -> BlockParams {
        BlockParams {
            block_size: self.config.block_size,
            block_mac_bytes: self.config.block_mac_bytes,
            block_mac_rand_bytes: self.config.block_mac_rand_bytes,
            allow_holes: self.config.allow_holes,
            unique_iv: self.config.unique_iv,
        }
    }

    pub fn encode_path(&self, plain_path: &str) -> Result<String> {
        name::encode_path(&self.unlocked.volume_key, &self.unlocked.volume_iv, self.config.chained_name_iv, plain_path)
    }

    pub fn decode_path(&self, cipher_path: &str) -> Result<String> {
        name::decode_path(&self.unlocked.volume_key, &self.unlocked.volume_iv, self.config.chained_name_iv, cipher_path)
    }

    /// The encode-side conflict variant of [`Volume::encode_path`], gated on
    /// a caller-supplied "does this ciphertext path already exist?"
    /// predicate — an explicit opt-in, never ambient state.
    pub fn encode_path_checking_conflicts(&self, plain_path: &str, file_exists: impl Fn(&str) -> bool) -> Result<String> {
        name::encode_path_checking_conflicts(
            &self.unlocked.volume_key,
            &self.unlocked.volume_iv,
            self.config.chained_name_iv,
            plain_path,
            file_exists,
        )
    }

    pub fn to_encoded_size(&self, n_plain: u64) -> u64 {
        block::to_encoded(&self.block_params(), n_plain)
    }

    pub fn to_decoded_size(&self, n_cipher: u64) -> u64 {
        block::to_decoded(&self.block_params(), n_cipher)
    }

    fn ciphertext_path(&self, cipher_relative: &str) -> PathBuf {
        self.root.join(cipher_relative)
    }

    /// Opens (creating the backing ciphertext file if absent) a handle for
    /// `plain_path`. Size-changing operations on the returned handle are not
    /// serialized against other handles by themselves — call
    /// [`Volume::lock_path`] around `set_length`-class operations when two
    /// handles to the same path might race.
    pub fn open(&self, plain_path: &str) -> Result<FileHandle<FsBackend>> {
        if self.config.reverse {
            return Err(VolumeError::IllegalState("cannot open a reverse-mode volume for forward I/O".into()));
        }
        let cipher_path = self.encode_path(plain_path)?;
        let full_path = self.ciphertext_path(&cipher_path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).map_err(VolumeError::WriteError)?;
        }
        let storage = FsBackend::open(&full_path).map_err(VolumeError::ReadError)?;
        Ok(FileHandle::new(storage, plain_path.to_string(), &self.unlocked, self.block_params(), self.config.external_iv_chaining))
    }

    /// Opens `plain_path` for [`FileHandle::reverse_read`]: the on-disk
    /// bytes under `plain_path` (unencrypted) are treated as plaintext and
    /// the handle produces ciphertext bytes. Only valid on a reverse-mode
    /// volume; writes are never offered through this path.
    pub fn open_reverse(&self, plain_path: &str) -> Result<FileHandle<FsBackend>> {
        if !self.config.reverse {
            return Err(VolumeError::IllegalState("reverse_read requires a reverse-mode volume".into()));
        }
        let storage = FsBackend::open(&self.root.join(plain_path)).map_err(VolumeError::ReadError)?;
        Ok(FileHandle::new(storage, plain_path.to_string(), &self.unlocked, self.block_params(), false))
    }

    /// Current plaintext size of `plain_path`'s backing ciphertext file, or
    /// 0 if it doesn't exist yet. Callers use this to seed `current_plain`
    /// for [`FileHandle::write`]/[`FileHandle::set_length`], since neither
    /// tracks size itself — the caller's stat layer owns that.
    pub fn file_size_plain(&self, plain_path: &str) -> Result<u64> {
        let cipher_path = self.encode_path(plain_path)?;
        match fs::metadata(self.ciphertext_path(&cipher_path)) {
            Ok(meta) => Ok(self.to_decoded_size(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(VolumeError::ReadError(e)),
        }
    }

    /// Acquires the cross-handle lock for `plain_path`, for size-changing
    /// operations issued outside a single handle's own mutex.
    pub fn lock_path(&self, plain_path: &str) -> crate::handle::registry::PathLockGuard<'_> {
        self.registry.acquire(Path::new(plain_path))
    }

    /// Lists the plaintext names directly inside `plain_dir` (`""` for the
    /// volume root). A ciphertext entry that fails to decode is skipped —
    /// non-fatal for the directory as a whole — rather than failing the
    /// whole listing.
    #[instrument(skip(self))]
    pub fn list_dir(&self, plain_dir: &str) -> Result<Vec<String>> {
        let cipher_dir = self.encode_path(plain_dir)?;
        let dir_path = if cipher_dir.is_empty() { self.root.clone() } else { self.ciphertext_path(&cipher_dir) };
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir_path).map_err(VolumeError::ReadError)? {
            let entry = entry.map_err(VolumeError::ReadError)?;
            let raw_name = entry.file_name().to_string_lossy().into_owned();
            if plain_dir.is_empty() && raw_name == CONFIG_FILE_NAME {
                continue;
            }
            let mut decoded = String::new();
            match name::decode_name(&self.unlocked.volume_key, &self.unlocked.volume_iv, self.config.chained_name_iv, &raw_name, plain_dir, &mut decoded) {
                Ok(()) => names.push(decoded),
                Err(_) if !self.config.chained_name_iv => {
                    match name::try_extract_cloud_conflict_suffix(&raw_name) {
                        Some((core, suffix)) => {
                            let mut core_decoded = String::new();
                            match name::decode_name(&self.unlocked.volume_key, &self.unlocked.volume_iv, false, &core, plain_dir, &mut core_decoded) {
                                Ok(()) => names.push(name::insert_conflict_suffix(&core_decoded, &suffix)),
                                Err(e) => warn!(entry = %raw_name, error = %e, "skipping undecodable directory entry"),
                            }
                        }
                        None => warn!(entry = %raw_name, "skipping undecodable directory entry"),
                    }
                }
                Err(e) => warn!(entry = %raw_name, error = %e, "skipping undecodable directory entry"),
            }
        }
        Ok(names)
    }

    /// Renames `old_plain_path` to `new_plain_path`: renames the ciphertext
    /// file on disk, then re-keys the file-IV header under the new path's
    /// chain-IV policy if `external_iv_chaining` is set.
    pub fn rename(&self, old_plain_path: &str, new_plain_path: &str) -> Result<()> {
        let _old_lock = self.lock_path(old_plain_path);
        let _new_lock = self.lock_path(new_plain_path);
        let old_cipher = self.encode_path(old_plain_path)?;
        let new_cipher = self.encode_path(new_plain_path)?;
        fs::rename(self.ciphertext_path(&old_cipher), self.ciphertext_path(&new_cipher)).map_err(VolumeError::WriteError)?;

        if self.config.external_iv_chaining {
            let storage = FsBackend::open(&self.ciphertext_path(&new_cipher)).map_err(VolumeError::ReadError)?;
            let handle = FileHandle::new(storage, old_plain_path.to_string(), &self.unlocked, self.block_params(), true);
            handle.change_file_iv(new_plain_path.to_string())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn create_unlock_and_round_trip_a_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let volume = Volume::create_at(dir.path(), b"correct horse", CreateMode::Standard).unwrap();
            let handle = volume.open("notes/todo.txt").unwrap();
            handle.write(0, 0, b"buy milk").unwrap();
        }
        let volume = Volume::unlock_at(dir.path(), b"correct horse").unwrap();
        let handle = volume.open("notes/todo.txt").unwrap();
        let mut out = vec![0u8; 8];
        handle.read(0, &mut out).unwrap();
        assert_eq!(&out, b"buy milk");
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        Volume::create_at(dir.path(), b"right", CreateMode::Standard).unwrap();
        let err = Volume::unlock_at(dir.path(), b"wrong").unwrap_err();
        assert!(matches!(err, VolumeError::UnlockFailed));
    }

    #[test]
    fn list_dir_decodes_plaintext_names() {
        let dir = tempfile::tempdir().unwrap();
        let volume = Volume::create_at(dir.path(), b"pw", CreateMode::Standard).unwrap();
        volume.open("a.txt").unwrap().write(0, 0, b"x").unwrap();
        volume.open("b.txt").unwrap().write(0, 0, b"y").unwrap();

        let mut names = volume.list_dir("").unwrap();
        names.sort();
        assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[test]
    fn list_dir_skips_an_undecodable_entry_but_keeps_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let volume = Volume::create_at(dir.path(), b"pw", CreateMode::Standard).unwrap();
        volume.open("good.txt").unwrap().write(0, 0, b"x").unwrap();
        // drop a file whose name cannot possibly decode
        fs::File::create(dir.path().join("%%%not-base64%%%")).unwrap().write_all(b"junk").unwrap();

        let names = volume.list_dir("").unwrap();
        assert_eq!(names, vec!["good.txt".to_string()]);
    }

    #[test]
    fn reverse_volume_refuses_forward_open() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, unlocked) = VolumeConfig::create(b"pw", CreateMode::Standard);
        config.reverse = true;
        fs::write(dir.path().join(CONFIG_FILE_NAME), config.to_xml()).unwrap();
        let volume = Volume { root: dir.path().to_path_buf(), config, unlocked, registry: HandleRegistry::new() };
        assert!(matches!(volume.open("x.txt"), Err(VolumeError::IllegalState(_))));
    }

    #[test]
    fn rename_rekeys_header_when_external_iv_chaining_is_on() {
        let dir = tempfile::tempdir().unwrap();
        let volume = Volume::create_at(dir.path(), b"pw", CreateMode::Paranoia).unwrap();
        volume.open("dirA/file.txt").unwrap().write(0, 0, b"payload").unwrap();
        fs::create_dir_all(volume.ciphertext_path(&volume.encode_path("dirB").unwrap())).unwrap();
        volume.rename("dirA/file.txt", "dirB/file.txt").unwrap();

        let handle = volume.open("dirB/file.txt").unwrap();
        let mut out = vec![0u8; 7];
        handle.read(0, &mut out).unwrap();
        assert_eq!(&out, b"payload");
    }
}
