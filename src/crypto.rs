//! Block crypto I/O layer interposed between the unified view and the
//! upper layer's file content (spec §4.8).

use std::fs::File;
use std::os::unix::fs::FileExt;

use aes::Aes256;
use cbc::{Decryptor as CbcDec, Encryptor as CbcEnc};
use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::{FsError, FsResult};

pub const DEFAULT_BLOCK_SIZE: usize = 1024;
pub const DEFAULT_KEY_BITS: usize = 256;
pub const KEY_BYTES: usize = DEFAULT_KEY_BITS / 8;
pub const IV_BYTES: usize = 16; // AES block size

/// A fixed secret baked into the binary. Per spec §1 this crate does not
/// attempt to protect upper-layer confidentiality against an attacker who
/// can read the upper directory's key material -- the key is derived from
/// this constant combined with the mount's configured password.
const EMBEDDED_PEPPER: &[u8] = b"fuseoverlayfs-static-embedded-pepper-v1";

#[derive(Clone, Copy, Debug)]
pub struct CryptoConfig {
    pub block_size: usize,
    pub allow_holes: bool,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self { block_size: DEFAULT_BLOCK_SIZE, allow_holes: true }
    }
}

pub type Key = [u8; KEY_BYTES];

/// Derive the at-rest key once at startup from the mount password via
/// PBKDF2-HMAC-SHA1, salted with the embedded pepper.
pub fn derive_key(password: &str) -> Key {
    let mut out = [0u8; KEY_BYTES];
    pbkdf2::pbkdf2_hmac::<Sha1>(password.as_bytes(), EMBEDDED_PEPPER, 100_000, &mut out);
    out
}

/// Per-block IV: HMAC-SHA1(base_iv ‖ block_number), truncated to IV_BYTES.
fn derive_iv(key: &Key, block_number: u64) -> [u8; IV_BYTES] {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(key); // base IV is derived from the same per-fs key material
    mac.update(&block_number.to_le_bytes());
    let digest = mac.finalize().into_bytes();
    let mut iv = [0u8; IV_BYTES];
    iv.copy_from_slice(&digest[..IV_BYTES]);
    iv
}

fn all_zero(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

/// XOR-cascade forward: buf[i] ^= buf[i-1] for i in 1.. -- a running prefix
/// XOR so every output byte depends on every earlier input byte.
fn cascade_forward(buf: &mut [u8]) {
    for i in 1..buf.len() {
        buf[i] ^= buf[i - 1];
    }
}

/// Inverse of `cascade_forward`: must run from the high index down so that
/// `buf[i - 1]` is still the cascade value when it's consumed.
fn cascade_inverse(buf: &mut [u8]) {
    for i in (1..buf.len()).rev() {
        buf[i] ^= buf[i - 1];
    }
}

fn cbc_encrypt(key: &Key, iv: &[u8; IV_BYTES], buf: &mut [u8]) -> FsResult<()> {
    let len = buf.len();
    CbcEnc::<Aes256>::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| FsError::CryptoError)?;
    Ok(())
}

fn cbc_decrypt(key: &Key, iv: &[u8; IV_BYTES], buf: &mut [u8]) -> FsResult<()> {
    CbcDec::<Aes256>::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| FsError::CryptoError)?;
    Ok(())
}

fn cfb_encrypt(key: &Key, iv: &[u8; IV_BYTES], buf: &mut [u8]) {
    cfb_mode::Encryptor::<Aes256>::new(key.into(), iv.into()).encrypt(buf);
}

fn cfb_decrypt(key: &Key, iv: &[u8; IV_BYTES], buf: &mut [u8]) {
    cfb_mode::Decryptor::<Aes256>::new(key.into(), iv.into()).decrypt(buf);
}

/// Full-block path. `buf.len()` must be a multiple of the AES block size.
pub fn block_encode(key: &Key, block_number: u64, buf: &mut [u8]) -> FsResult<()> {
    if buf.len() % 16 != 0 {
        return Err(FsError::InvalidInput);
    }
    let iv = derive_iv(key, block_number);
    cbc_encrypt(key, &iv, buf)
}

/// Hole optimization lives at the call site: callers check `all_zero` on
/// the *stored* bytes before calling `block_decode` and skip decryption
/// entirely when holes are enabled (see `read_full_block`).
pub fn block_decode(key: &Key, block_number: u64, buf: &mut [u8]) -> FsResult<()> {
    if buf.len() % 16 != 0 {
        return Err(FsError::InvalidInput);
    }
    let iv = derive_iv(key, block_number);
    cbc_decrypt(key, &iv, buf)
}

/// Partial-block path (spec §4.8): a two-pass construction so every output
/// byte of a partial block depends on all its input bytes in both
/// directions, even though the stream cipher alone wouldn't guarantee that.
pub fn stream_encode(key: &Key, block_number: u64, buf: &mut [u8]) {
    cascade_forward(buf);
    cfb_encrypt(key, &derive_iv(key, block_number), buf);
    buf.reverse();
    cascade_forward(buf);
    cfb_encrypt(key, &derive_iv(key, block_number + 1), buf);
}

pub fn stream_decode(key: &Key, block_number: u64, buf: &mut [u8]) {
    cfb_decrypt(key, &derive_iv(key, block_number + 1), buf);
    cascade_inverse(buf);
    buf.reverse();
    cfb_decrypt(key, &derive_iv(key, block_number), buf);
    cascade_inverse(buf);
}

/// Per-node single-slot block cache (spec §3 "Block cache").
#[derive(Default)]
pub struct NodeCipherState {
    cache_offset: Option<u64>,
    cache_valid_len: usize,
    cache: Vec<u8>,
}

impl NodeCipherState {
    fn invalidate(&mut self) {
        self.cache_offset = None;
        self.cache_valid_len = 0;
    }
}

fn block_number_of(offset: u64, block_size: usize) -> u64 {
    offset / block_size as u64
}

fn block_start(block_number: u64, block_size: usize) -> u64 {
    block_number * block_size as u64
}

/// Fetch one full block through the cache, decrypting on miss. `file_len`
/// bounds how many bytes actually exist past the block start.
fn read_full_block(
    file: &File,
    key: &Key,
    cfg: &CryptoConfig,
    state: &mut NodeCipherState,
    block_number: u64,
    file_len: u64,
) -> FsResult<Vec<u8>> {
    let start = block_start(block_number, cfg.block_size);
    if state.cache_offset == Some(start) {
        let mut out = state.cache.clone();
        out.resize(cfg.block_size, 0);
        return Ok(out);
    }

    let mut raw = vec![0u8; cfg.block_size];
    let valid_len = if start >= file_len { 0 } else { ((file_len - start) as usize).min(cfg.block_size) };
    if valid_len > 0 {
        file.read_exact_at(&mut raw[..valid_len], start)?;
    }

    let mut plain = raw.clone();
    if cfg.allow_holes && valid_len == cfg.block_size && all_zero(&raw) {
        // hole: stored bytes are already plaintext zeros, skip decryption.
    } else if valid_len == cfg.block_size {
        block_decode(key, block_number, &mut plain)?;
    } else if valid_len > 0 {
        stream_decode(key, block_number, &mut plain[..valid_len]);
    }

    state.cache = plain.clone();
    state.cache_offset = Some(start);
    state.cache_valid_len = valid_len;
    Ok(plain)
}

/// Multi-block read (spec §4.8 "Multi-block read"): partial starts/ends use
/// a scratch block buffer; aligned interior whole blocks decrypt straight
/// into the caller's output.
pub fn read_at(
    file: &File,
    key: &Key,
    cfg: &CryptoConfig,
    state: &mut NodeCipherState,
    offset: u64,
    out: &mut [u8],
    file_len: u64,
) -> FsResult<usize> {
    if offset >= file_len {
        return Ok(0);
    }
    let want = out.len().min((file_len - offset) as usize);
    let mut done = 0;
    while done < want {
        let cur_offset = offset + done as u64;
        let block_number = block_number_of(cur_offset, cfg.block_size);
        let start = block_start(block_number, cfg.block_size);
        let within = (cur_offset - start) as usize;
        let block = read_full_block(file, key, cfg, state, block_number, file_len)?;
        let avail = cfg.block_size - within;
        let n = avail.min(want - done);
        out[done..done + n].copy_from_slice(&block[within..within + n]);
        done += n;
    }
    Ok(done)
}

/// Multi-block write (spec §4.8 "Multi-block write"): pads intermediate
/// blocks when the write extends past the current file size, then merges
/// new data into the affected blocks.
pub fn write_at(
    file: &File,
    key: &Key,
    cfg: &CryptoConfig,
    state: &mut NodeCipherState,
    offset: u64,
    data: &[u8],
    file_len: u64,
) -> FsResult<usize> {
    if offset > file_len {
        pad_to(file, key, cfg, state, file_len, offset)?;
    }

    // The logical length this write leaves behind; only the block that
    // contains its last byte may be stored as a partial (stream-cipher)
    // block on disk -- every earlier block is always a full CBC block.
    let new_len = file_len.max(offset + data.len() as u64);

    let mut done = 0;
    while done < data.len() {
        let cur_offset = offset + done as u64;
        let block_number = block_number_of(cur_offset, cfg.block_size);
        let start = block_start(block_number, cfg.block_size);
        let within = (cur_offset - start) as usize;
        let n = (cfg.block_size - within).min(data.len() - done);

        let cur_file_len = file_len.max(offset + done as u64).max(start);
        let mut block = if within == 0 && n == cfg.block_size {
            vec![0u8; cfg.block_size]
        } else {
            read_full_block(file, key, cfg, state, block_number, cur_file_len)?
        };
        block[within..within + n].copy_from_slice(&data[done..done + n]);

        let block_end = start + cfg.block_size as u64;
        let valid_len = if block_end <= new_len { cfg.block_size } else { (new_len - start) as usize };

        let write_result: FsResult<()> = (|| {
            if valid_len < cfg.block_size {
                // This is the file's new last block and it doesn't fill a
                // whole block: persist only the logical bytes via the same
                // stream-cipher convention copy-up uses for a trailing
                // partial block, never a zero-padded full CBC block.
                let mut cipher_buf = block[..valid_len].to_vec();
                stream_encode(key, block_number, &mut cipher_buf);
                file.write_all_at(&cipher_buf, start)?;
            } else if cfg.allow_holes && all_zero(&block) {
                file.write_all_at(&block, start)?;
            } else {
                let mut cipher_buf = block.clone();
                block_encode(key, block_number, &mut cipher_buf)?;
                file.write_all_at(&cipher_buf, start)?;
            }
            Ok(())
        })();

        match write_result {
            Ok(()) => {
                state.cache = block;
                state.cache_offset = Some(start);
                state.cache_valid_len = valid_len;
            }
            Err(e) => {
                state.invalidate();
                return Err(e);
            }
        }
        done += n;
    }
    file.set_len(new_len)?;
    Ok(done)
}

fn pad_to(
    file: &File,
    key: &Key,
    cfg: &CryptoConfig,
    state: &mut NodeCipherState,
    file_len: u64,
    target: u64,
) -> FsResult<()> {
    if file_len % cfg.block_size as u64 != 0 {
        // extend the last partial block to full size.
        let last_block = block_number_of(file_len, cfg.block_size);
        let mut block = read_full_block(file, key, cfg, state, last_block, file_len)?;
        let within = (file_len - block_start(last_block, cfg.block_size)) as usize;
        for b in &mut block[within..] {
            *b = 0;
        }
        let start = block_start(last_block, cfg.block_size);
        let mut cipher_buf = block.clone();
        block_encode(key, last_block, &mut cipher_buf)?;
        file.write_all_at(&cipher_buf, start)?;
        state.cache = block;
        state.cache_offset = Some(start);
        state.cache_valid_len = cfg.block_size;
    }
    let mut next_start = if file_len % cfg.block_size as u64 == 0 {
        file_len
    } else {
        (block_number_of(file_len, cfg.block_size) + 1) * cfg.block_size as u64
    };
    if !cfg.allow_holes {
        let zero = vec![0u8; cfg.block_size];
        while next_start < target {
            let block_number = block_number_of(next_start, cfg.block_size);
            let mut cipher_buf = zero.clone();
            block_encode(key, block_number, &mut cipher_buf)?;
            file.write_all_at(&cipher_buf, next_start)?;
            next_start += cfg.block_size as u64;
        }
    }
    file.set_len(target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file() -> (tempfile::NamedTempFile, File) {
        let f = tempfile::NamedTempFile::new().unwrap();
        let fh = f.reopen().unwrap();
        (f, fh)
    }

    #[test]
    fn full_block_round_trips() {
        let key = derive_key("hunter2");
        let mut buf = vec![0x42u8; DEFAULT_BLOCK_SIZE];
        let orig = buf.clone();
        block_encode(&key, 7, &mut buf).unwrap();
        assert_ne!(buf, orig);
        block_decode(&key, 7, &mut buf).unwrap();
        assert_eq!(buf, orig);
    }

    #[test]
    fn stream_path_is_self_inverse_for_partial_blocks() {
        let key = derive_key("hunter2");
        for len in [1usize, 3, 17, 200] {
            let mut buf: Vec<u8> = (0..len as u8).collect();
            let orig = buf.clone();
            stream_encode(&key, 3, &mut buf);
            assert_ne!(buf, orig, "len={len}");
            stream_decode(&key, 3, &mut buf);
            assert_eq!(buf, orig, "len={len}");
        }
    }

    #[test]
    fn cascade_is_self_inverse() {
        let mut buf = vec![1u8, 2, 3, 4, 5, 6, 7];
        let orig = buf.clone();
        cascade_forward(&mut buf);
        assert_ne!(buf, orig);
        cascade_inverse(&mut buf);
        assert_eq!(buf, orig);
    }

    #[test]
    fn write_then_read_returns_same_bytes() {
        let (_tmp, file) = scratch_file();
        let key = derive_key("pw");
        let cfg = CryptoConfig::default();
        let mut state = NodeCipherState::default();

        let data = b"hello, overlay world!";
        let n = write_at(&file, &key, &cfg, &mut state, 0, data, 0).unwrap();
        assert_eq!(n, data.len());

        let mut state2 = NodeCipherState::default();
        let mut out = vec![0u8; data.len()];
        let file_len = file.metadata().unwrap().len();
        let r = read_at(&file, &key, &cfg, &mut state2, 0, &mut out, file_len).unwrap();
        assert_eq!(r, data.len());
        assert_eq!(&out, data);
    }

    #[test]
    fn read_past_eof_returns_zero_not_error() {
        let (_tmp, file) = scratch_file();
        let key = derive_key("pw");
        let cfg = CryptoConfig::default();
        let mut state = NodeCipherState::default();
        let mut out = vec![0u8; 16];
        let n = read_at(&file, &key, &cfg, &mut state, 1_000_000, &mut out, 0).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn write_extending_past_eof_pads_with_zero_blocks() {
        let (_tmp, file) = scratch_file();
        let key = derive_key("pw");
        let mut cfg = CryptoConfig::default();
        cfg.allow_holes = false;
        let mut state = NodeCipherState::default();

        // write a single byte at an offset well past a block boundary.
        let offset = (cfg.block_size * 3 + 5) as u64;
        write_at(&file, &key, &cfg, &mut state, offset, b"Z", 0).unwrap();

        let mut state2 = NodeCipherState::default();
        let file_len = file.metadata().unwrap().len();
        let mut out = vec![0u8; file_len as usize];
        read_at(&file, &key, &cfg, &mut state2, 0, &mut out, file_len).unwrap();
        assert_eq!(out[offset as usize], b'Z');
        assert!(out[..offset as usize].iter().all(|&b| b == 0));
    }

    #[test]
    fn sub_block_write_preserves_logical_length() {
        let (_tmp, file) = scratch_file();
        let key = derive_key("pw");
        let cfg = CryptoConfig::default();
        let mut state = NodeCipherState::default();

        write_at(&file, &key, &cfg, &mut state, 0, b"x", 0).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 1);

        let mut state2 = NodeCipherState::default();
        let mut out = vec![0u8; 16];
        let r = read_at(&file, &key, &cfg, &mut state2, 0, &mut out, 1).unwrap();
        assert_eq!(r, 1);
        assert_eq!(&out[..1], b"x");
    }
}
