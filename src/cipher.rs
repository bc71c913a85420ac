//! Raw AES block transform with chaining state.
//!
//! One key, one direction, one mode. `process()` consumes block-aligned
//! runs and keeps the CBC chaining IV up to date; everything above the
//! block level (buffering, padding, ciphertext stealing) lives in
//! [`crate::stream`]. The chaining IV is readable because the CBC
//! stealing construction on the receive side needs the second-to-last
//! ciphertext block, which is exactly the IV most recently consumed.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use anyhow::{bail, Result};

/// AES block width in bytes.
pub const BLOCK_SIZE: usize = 16;

/// IV length for AES-CBC (equal to the block width).
pub const IV_LEN: usize = 16;

/// Block chaining mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Each block transformed independently.
    Ecb,
    /// Cipher block chaining.
    Cbc,
}

/// Transform direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// AES key schedule for the three H.235 key sizes.
enum AesKey {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl AesKey {
    fn new(key: &[u8]) -> Result<Self> {
        match key.len() {
            16 => Ok(Self::Aes128(Aes128::new(GenericArray::from_slice(key)))),
            24 => Ok(Self::Aes192(Aes192::new(GenericArray::from_slice(key)))),
            32 => Ok(Self::Aes256(Aes256::new(GenericArray::from_slice(key)))),
            n => bail!("unsupported AES key length: {} bytes", n),
        }
    }

    fn encrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(k) => k.encrypt_block(block),
            Self::Aes192(k) => k.encrypt_block(block),
            Self::Aes256(k) => k.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut [u8; BLOCK_SIZE]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(k) => k.decrypt_block(block),
            Self::Aes192(k) => k.decrypt_block(block),
            Self::Aes256(k) => k.decrypt_block(block),
        }
    }
}

/// An AES context for one direction of one stream.
///
/// Rekeying resets the context in place; the IV is re-installed per
/// frame by the owner.
pub struct BlockCipher {
    key: AesKey,
    mode: Mode,
    direction: Direction,
    iv: [u8; IV_LEN],
    padding: bool,
}

impl BlockCipher {
    /// Create a context from a raw 16/24/32-byte key.
    pub fn new(key: &[u8], mode: Mode, direction: Direction) -> Result<Self> {
        Ok(Self {
            key: AesKey::new(key)?,
            mode,
            direction,
            iv: [0u8; IV_LEN],
            padding: false,
        })
    }

    /// Install a new key, clearing the chaining state.
    pub fn set_key(&mut self, key: &[u8]) -> Result<()> {
        self.key = AesKey::new(key)?;
        self.iv = [0u8; IV_LEN];
        self.padding = false;
        Ok(())
    }

    /// Install the IV for the next chaining run.
    pub fn set_iv(&mut self, iv: &[u8; IV_LEN]) {
        self.iv = *iv;
    }

    /// The current chaining IV: the last ciphertext block consumed
    /// (decrypt) or produced (encrypt), or the installed IV if no block
    /// has been processed yet.
    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    pub fn iv_len(&self) -> usize {
        IV_LEN
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether the stream layer should apply PKCS-style padding.
    pub fn set_padding(&mut self, padding: bool) {
        self.padding = padding;
    }

    pub fn padding(&self) -> bool {
        self.padding
    }

    /// Transform a block-aligned run of bytes into `out`.
    ///
    /// In CBC mode the chaining IV is applied and advanced block by
    /// block, so consecutive calls continue the same chain.
    pub fn process(&mut self, input: &[u8], out: &mut [u8]) -> Result<()> {
        if input.len() % BLOCK_SIZE != 0 {
            bail!("input not block aligned: {} bytes", input.len());
        }
        if out.len() < input.len() {
            bail!(
                "output too small: {} bytes for {} bytes of input",
                out.len(),
                input.len()
            );
        }

        for (src, dst) in input
            .chunks_exact(BLOCK_SIZE)
            .zip(out.chunks_exact_mut(BLOCK_SIZE))
        {
            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(src);

            match (self.mode, self.direction) {
                (Mode::Ecb, Direction::Encrypt) => self.key.encrypt_block(&mut block),
                (Mode::Ecb, Direction::Decrypt) => self.key.decrypt_block(&mut block),
                (Mode::Cbc, Direction::Encrypt) => {
                    for (b, v) in block.iter_mut().zip(self.iv.iter()) {
                        *b ^= v;
                    }
                    self.key.encrypt_block(&mut block);
                    self.iv.copy_from_slice(&block);
                }
                (Mode::Cbc, Direction::Decrypt) => {
                    self.key.decrypt_block(&mut block);
                    for (b, v) in block.iter_mut().zip(self.iv.iter()) {
                        *b ^= v;
                    }
                    self.iv.copy_from_slice(src);
                }
            }

            dst.copy_from_slice(&block);
        }

        Ok(())
    }
}
