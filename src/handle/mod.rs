//! Per-open-file state and the block-addressed read/write/truncate logic:
//! offset-based `read`/`write` with read-modify-write for partial blocks,
//! `set_length` for truncate/extend, `change_file_iv` for rename-with-rekey,
//! and `reverse_read` for the reverse-mode mirror.

pub mod registry;

use std::sync::Mutex;

use rand::RngCore;

use crate::block::{self, BlockParams};
use crate::config::UnlockedVolume;
use crate::error::{Result, VolumeError};
use crate::name;
use crate::primitives;
use crate::storage::StorageBackend;

const WRITE_RETRY_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY_MS: u64 = 10;

#[derive(Clone, Copy, PartialEq, Eq)]
enum FileIv {
    Unresolved,
    Resolved(u64),
}

struct Inner<S> {
    storage: S,
    plain_path: String,
    file_iv: FileIv,
    block_buf: Vec<u8>,
}

/// State for one open file. Holds its own mutex so reads/writes through the
/// same handle are totally ordered, matching the concurrency model's handle-
/// mutex rule; cross-handle size changes go through [`registry::HandleRegistry`]
/// instead.
pub struct FileHandle<S> {
    inner: Mutex<Inner<S>>,
    volume_key: Vec<u8>,
    volume_iv: [u8; 16],
    params: BlockParams,
    external_iv_chaining: bool,
}

impl<S: StorageBackend> FileHandle<S> {
    pub fn new(storage: S, plain_path: String, volume: &UnlockedVolume, params: BlockParams, external_iv_chaining: bool) -> Self {
        FileHandle {
            inner: Mutex::new(Inner {
                storage,
                plain_path,
                file_iv: FileIv::Unresolved,
                block_buf: Vec::new(),
            }),
            volume_key: volume.volume_key.clone(),
            volume_iv: volume.volume_iv,
            params,
            external_iv_chaining,
        }
    }

    fn data_per_block(&self) -> u64 {
        self.params.block_size as u64 - (self.params.block_mac_bytes + self.params.block_mac_rand_bytes) as u64
    }

    fn header_base_offset(&self) -> u64 {
        if self.params.unique_iv {
            8
        } else {
            0
        }
    }

    fn iv_header_seed(&self, plain_path: &str) -> [u8; 8] {
        if self.external_iv_chaining {
            name::chain_iv_over_path(&self.volume_key, plain_path)
        } else {
            [0u8; 8]
        }
    }

    /// Resolves (and caches) the file IV, generating and persisting a fresh
    /// one if `create` is set and none exists yet. Returns `Ok(None)` when
    /// the backing file is empty and `create` is false, which callers treat
    /// as a 0-byte read rather than an error.
    fn resolve_file_iv(&self, inner: &mut Inner<S>, create: bool) -> Result<Option<u64>> {
        if !self.params.unique_iv {
            return Ok(Some(0));
        }
        if let FileIv::Resolved(v) = inner.file_iv {
            return Ok(Some(v));
        }

        let mut header = [0u8; 8];
        let n = inner.storage.read_at(0, &mut header).map_err(VolumeError::ReadError)?;

        let header = if n == 8 {
            header
        } else if create {
            let mut fresh = [0u8; 8];
            rand::thread_rng().fill_bytes(&mut fresh);
            inner
                .storage
                .write_at(0, &fresh)
                .map_err(VolumeError::WriteError)?;
            inner.storage.flush().map_err(VolumeError::WriteError)?;
            fresh
        } else if n == 0 {
            return Ok(None);
        } else {
            return Err(VolumeError::ReadError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "partial file IV header",
            )));
        };

        let seed = self.iv_header_seed(&inner.plain_path);
        let decoded = block::stream_decrypt(&self.volume_key, &self.volume_iv, &seed, &header)?;
        let file_iv = primitives::be_u64(&decoded);
        inner.file_iv = FileIv::Resolved(file_iv);
        Ok(Some(file_iv))
    }

    fn write_header(&self, inner: &mut Inner<S>, file_iv: u64) -> Result<()> {
        let seed = self.iv_header_seed(&inner.plain_path);
        let plain = primitives::u64_be_bytes(file_iv);
        let encrypted = block::stream_encrypt(&self.volume_key, &self.volume_iv, &seed, &plain)?;
        self.write_with_retry(inner, 0, &encrypted)
    }

    fn write_with_retry(&self, inner: &mut Inner<S>, offset: u64, data: &[u8]) -> Result<()> {
        for attempt in 0..WRITE_RETRY_ATTEMPTS {
            let n = inner.storage.write_at(offset, data).map_err(VolumeError::WriteError)?;
            if n == data.len() {
                return Ok(());
            }
            if attempt + 1 < WRITE_RETRY_ATTEMPTS {
                std::thread::sleep(std::time::Duration::from_millis(WRITE_RETRY_DELAY_MS));
            }
        }
        Err(VolumeError::WriteError(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "storage backend would not accept the full write after retrying",
        )))
    }

    fn block_storage_offset(&self, block_num: u64) -> u64 {
        self.header_base_offset() + block_num * self.params.block_size as u64
    }

    fn write_block(&self, inner: &mut Inner<S>, block_num: u64, file_iv: u64, plaintext: &[u8]) -> Result<()> {
        let ciphertext = block::encode_block(&self.params, &self.volume_key, &self.volume_iv, block_num, file_iv, plaintext)?;
        let offset = self.block_storage_offset(block_num);
        self.write_with_retry(inner, offset, &ciphertext)
    }

    fn read_block_plaintext(&self, inner: &mut Inner<S>, block_num: u64, file_iv: u64) -> Result<Option<Vec<u8>>> {
        inner.block_buf.clear();
        inner.block_buf.resize(self.params.block_size as usize, 0);
        let offset = self.block_storage_offset(block_num);
        let n = inner
            .storage
            .read_at(offset, &mut inner.block_buf)
            .map_err(VolumeError::ReadError)?;
        if n == 0 {
            return Ok(None);
        }
        let ciphertext = inner.block_buf[..n].to_vec();
        Ok(Some(block::decode_block(&self.params, &self.volume_key, &self.volume_iv, block_num, file_iv, &ciphertext)?))
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock().expect("handle mutex poisoned");
        let file_iv = match self.resolve_file_iv(&mut inner, false)? {
            Some(v) => v,
            None => return Ok(0),
        };
        let dpb = self.data_per_block();

        let first_block = offset / dpb;
        let last_block = (offset + buf.len() as u64 - 1) / dpb;
        let mut shift = (offset % dpb) as usize;
        let mut written = 0usize;

        for block_num in first_block..=last_block {
            let plaintext = match self.read_block_plaintext(&mut inner, block_num, file_iv)? {
                Some(p) => p,
                None => break,
            };
            if shift >= plaintext.len() {
                break;
            }
            let available = plaintext.len() - shift;
            let take = available.min(buf.len() - written);
            buf[written..written + take].copy_from_slice(&plaintext[shift..shift + take]);
            written += take;
            shift = 0;
            if written == buf.len() {
                break;
            }
        }
        Ok(written)
    }

    pub fn write(&self, current_size_plain: u64, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock().expect("handle mutex poisoned");
        let file_iv = self
            .resolve_file_iv(&mut inner, true)?
            .expect("resolve_file_iv with create=true never returns Empty");

        if offset > current_size_plain {
            self.set_length_locked(&mut inner, file_iv, current_size_plain, offset)?;
        }
        let current_size_plain = current_size_plain.max(offset);

        let dpb = self.data_per_block();
        let mut block_num = offset / dpb;
        let mut shift = (offset % dpb) as usize;
        let mut consumed = 0usize;

        while consumed < data.len() {
            let remaining_input = data.len() - consumed;
            let writing_full_block = shift == 0 && remaining_input >= dpb as usize;
            let block_start = block_num * dpb;
            let at_or_past_eof = block_start >= current_size_plain;

            let consumed_this_block = if writing_full_block {
                dpb as usize
            } else {
                (dpb as usize - shift).min(remaining_input)
            };

            let new_plain = if writing_full_block {
                data[consumed..consumed + dpb as usize].to_vec()
            } else if at_or_past_eof && shift == 0 {
                data[consumed..consumed + consumed_this_block].to_vec()
            } else {
                let mut existing = self
                    .read_block_plaintext(&mut inner, block_num, file_iv)?
                    .unwrap_or_default();
                let needed_len = shift + consumed_this_block;
                if existing.len() < needed_len {
                    existing.resize(needed_len, 0);
                }
                existing[shift..needed_len].copy_from_slice(&data[consumed..consumed + consumed_this_block]);
                existing
            };

            self.write_block(&mut inner, block_num, file_iv, &new_plain)?;
            consumed += consumed_this_block;
            block_num += 1;
            shift = 0;
        }
        Ok(consumed)
    }

    pub fn set_length(&self, current_size_plain: u64, new_plain: u64) -> Result<()> {
        let mut inner = self.inner.lock().expect("handle mutex poisoned");
        let file_iv = self
            .resolve_file_iv(&mut inner, true)?
            .expect("resolve_file_iv with create=true never returns Empty");
        self.set_length_locked(&mut inner, file_iv, current_size_plain, new_plain)
    }

    fn set_length_locked(&self, inner: &mut Inner<S>, file_iv: u64, current_plain: u64, new_plain: u64) -> Result<()> {
        if new_plain == current_plain {
            return Ok(());
        }
        if new_plain == 0 {
            inner.storage.set_size(0).map_err(VolumeError::WriteError)?;
            inner.file_iv = FileIv::Unresolved;
            return Ok(());
        }

        let dpb = self.data_per_block();
        let boundary_block = if new_plain < current_plain {
            (new_plain - 1) / dpb
        } else if current_plain > 0 {
            (current_plain - 1) / dpb
        } else {
            0
        };
        let saved = if current_plain > 0 {
            self.read_block_plaintext(inner, boundary_block, file_iv)?
        } else {
            None
        };

        let new_storage_size = self.header_base_offset() + block::to_encoded(&self.params, new_plain);
        inner.storage.set_size(new_storage_size).map_err(VolumeError::WriteError)?;

        if new_plain < current_plain {
            if let Some(mut tail) = saved {
                let tail_len = match new_plain % dpb {
                    0 => dpb as usize,
                    r => r as usize,
                };
                tail.resize(tail_len, 0);
                self.write_block(inner, boundary_block, file_iv, &tail)?;
            }
        } else {
            let new_last_block = (new_plain - 1) / dpb;
            if let Some(mut boundary) = saved {
                let target_len = if boundary_block == new_last_block {
                    (new_plain - boundary_block * dpb) as usize
                } else {
                    dpb as usize
                };
                if boundary.len() < target_len {
                    boundary.resize(target_len, 0);
                    self.write_block(inner, boundary_block, file_iv, &boundary)?;
                }
            }
            for block_num in (boundary_block + 1)..=new_last_block {
                let len = if block_num == new_last_block {
                    match new_plain - block_num * dpb {
                        0 => dpb as usize,
                        r => r as usize,
                    }
                } else {
                    dpb as usize
                };
                let zero_plain = vec![0u8; len];
                self.write_block(inner, block_num, file_iv, &zero_plain)?;
            }
        }
        Ok(())
    }

    /// Re-encodes the file-IV header under `new_plain_path`'s chain-IV
    /// policy, keeping the same underlying file IV value. Used on rename
    /// when `external_iv_chaining` is set.
    pub fn change_file_iv(&self, new_plain_path: String) -> Result<()> {
        let mut inner = self.inner.lock().expect("handle mutex poisoned");
        let file_iv = match self.resolve_file_iv(&mut inner, false)? {
            Some(v) => v,
            None => {
                inner.plain_path = new_plain_path;
                return Ok(());
            }
        };
        inner.plain_path = new_plain_path;
        self.write_header(&mut inner, file_iv)
    }

    /// Mirrors `read`, but treats on-disk bytes as plaintext and produces
    /// ciphertext: blocks align on `block_size` with no header, `file_iv`
    /// is always 0.
    pub fn reverse_read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock().expect("handle mutex poisoned");
        let block_size = self.params.block_size as u64;
        let first_block = offset / block_size;
        let last_block = (offset + buf.len() as u64 - 1) / block_size;
        let mut shift = (offset % block_size) as usize;
        let mut written = 0usize;

        for block_num in first_block..=last_block {
            inner.block_buf.clear();
            inner.block_buf.resize(self.params.block_size as usize, 0);
            let storage_offset = block_num * block_size;
            let n = inner
                .storage
                .read_at(storage_offset, &mut inner.block_buf)
                .map_err(VolumeError::ReadError)?;
            if n == 0 {
                break;
            }
            let plain_on_disk = inner.block_buf[..n].to_vec();
            let ciphertext = block::encode_block(&self.params, &self.volume_key, &self.volume_iv, block_num, 0, &plain_on_disk)?;
            if shift >= ciphertext.len() {
                break;
            }
            let available = ciphertext.len() - shift;
            let take = available.min(buf.len() - written);
            buf[written..written + take].copy_from_slice(&ciphertext[shift..shift + take]);
            written += take;
            shift = 0;
            if written == buf.len() {
                break;
            }
        }
        Ok(written)
    }
}
