//! Per-call AES engine: keying, per-frame IVs, padding/stealing dispatch.
//!
//! One engine serves both directions of a stream — the same key is
//! installed in an encrypt context and a decrypt context, and only the
//! IV rotates per frame, derived from the RTP sequence number and
//! timestamp. Outbound payloads that do not fill the last block get
//! PKCS-style padding (and the RTP padding bit); inbound payloads are
//! depadded or un-stolen according to the padding bit the peer sent.

use anyhow::{bail, Result};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::cipher::{BlockCipher, Direction, Mode, BLOCK_SIZE, IV_LEN};
use crate::stream::CipherStream;

/// OID for AES-128-CBC media encryption (NIST aes128-CBC arc).
pub const ID_AES128: &str = "2.16.840.1.101.3.4.1.2";
/// OID for AES-192-CBC media encryption.
pub const ID_AES192: &str = "2.16.840.1.101.3.4.1.22";
/// OID for AES-256-CBC media encryption.
pub const ID_AES256: &str = "2.16.840.1.101.3.4.1.42";

/// The per-frame IV seed is always 6 bytes: 2 bytes RTP sequence
/// number followed by 4 bytes RTP timestamp, in network byte order.
pub const IV_SEQUENCE_LEN: usize = 6;

/// Key length in bytes for a recognized algorithm OID.
pub fn oid_key_length(oid: &str) -> Option<usize> {
    match oid {
        ID_AES128 => Some(16),
        ID_AES192 => Some(24),
        ID_AES256 => Some(32),
        _ => None,
    }
}

/// Tile the 6-byte IV seed across `iv`, with a partial copy at the
/// end; an absent seed zero-fills the IV.
pub fn build_iv(seed: Option<&[u8; IV_SEQUENCE_LEN]>, iv: &mut [u8]) {
    match seed {
        Some(seq) => {
            for chunk in iv.chunks_mut(IV_SEQUENCE_LEN) {
                chunk.copy_from_slice(&seq[..chunk.len()]);
            }
        }
        None => iv.fill(0),
    }
}

/// Generate a random key of the length the OID calls for, from the
/// given randomness source. Unrecognized OIDs yield an empty key.
pub fn random_key_for_oid(oid: &str, rng: &mut impl RngCore) -> Vec<u8> {
    match oid_key_length(oid) {
        Some(n) => {
            let mut key = vec![0u8; n];
            rng.fill_bytes(&mut key);
            key
        }
        None => {
            tracing::warn!("unsupported algorithm {}", oid);
            Vec::new()
        }
    }
}

fn install_key(
    slot: &mut Option<BlockCipher>,
    key: &[u8],
    direction: Direction,
) -> Result<()> {
    match slot {
        Some(ctx) => ctx.set_key(key),
        None => {
            *slot = Some(BlockCipher::new(key, Mode::Cbc, direction)?);
            Ok(())
        }
    }
}

/// Encryption/decryption engine for one media or key-wrapping stream.
pub struct CryptoEngine {
    oid: String,
    enc: Option<BlockCipher>,
    dec: Option<BlockCipher>,
    enc_stream: CipherStream,
    dec_stream: CipherStream,
    enc_block: usize,
    enc_iv_len: usize,
    dec_block: usize,
    dec_iv_len: usize,
    initialized: bool,
    operations: u64,
}

impl CryptoEngine {
    /// Create an unkeyed engine for the given algorithm OID.
    pub fn new(oid: &str) -> Self {
        Self {
            oid: oid.to_owned(),
            enc: None,
            dec: None,
            enc_stream: CipherStream::new(),
            dec_stream: CipherStream::new(),
            enc_block: 0,
            enc_iv_len: 0,
            dec_block: 0,
            dec_iv_len: 0,
            initialized: false,
            operations: 0,
        }
    }

    /// Create an engine and key it immediately.
    pub fn with_key(oid: &str, key: &[u8]) -> Self {
        let mut engine = Self::new(oid);
        engine.set_key(key);
        engine
    }

    pub fn oid(&self) -> &str {
        &self.oid
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Count of successful encrypt/decrypt operations since the last
    /// rekey.
    pub fn operation_count(&self) -> u64 {
        self.operations
    }

    /// Install `key` in both directions and reset all per-frame state.
    ///
    /// An unrecognized OID or a key of the wrong length leaves the
    /// engine unkeyed; every subsequent operation then produces empty
    /// output.
    pub fn set_key(&mut self, key: &[u8]) {
        self.initialized = false;

        let Some(expected) = oid_key_length(&self.oid) else {
            tracing::warn!("unsupported algorithm {}", self.oid);
            return;
        };
        if key.len() != expected {
            tracing::warn!(
                "key length {} does not fit algorithm {} (need {})",
                key.len(),
                self.oid,
                expected
            );
            return;
        }

        // Rekey in place where a context already exists.
        if let Err(err) = install_key(&mut self.enc, key, Direction::Encrypt) {
            tracing::warn!("failed to set up encrypt context: {:#}", err);
            return;
        }
        if let Err(err) = install_key(&mut self.dec, key, Direction::Decrypt) {
            tracing::warn!("failed to set up decrypt context: {:#}", err);
            return;
        }

        if let Some(ctx) = &self.enc {
            self.enc_block = ctx.block_size();
            self.enc_iv_len = ctx.iv_len();
        }
        if let Some(ctx) = &self.dec {
            self.dec_block = ctx.block_size();
            self.dec_iv_len = ctx.iv_len();
        }
        self.enc_stream.reset();
        self.dec_stream.reset();
        self.operations = 0;
        self.initialized = true;
    }

    /// Generate a random key for this engine's OID, install it, and
    /// return it. The returned key is what gets wrapped and sent to
    /// the peer.
    pub fn generate_random_key(&mut self) -> Vec<u8> {
        let key = random_key_for_oid(&self.oid, &mut OsRng);
        self.set_key(&key);
        key
    }

    /// Encrypt `input` into `out`, returning the ciphertext length.
    ///
    /// `out` must hold at least `input.len()` plus one block. On
    /// return `rtp_padding` tells the caller what to put in the RTP
    /// padding bit.
    pub fn encrypt_into(
        &mut self,
        input: &[u8],
        out: &mut [u8],
        iv_seed: Option<&[u8; IV_SEQUENCE_LEN]>,
        rtp_padding: &mut bool,
    ) -> Result<usize> {
        if !self.initialized {
            tracing::debug!("encrypt on an unkeyed engine");
            return Ok(0);
        }
        if out.len() < input.len() + self.enc_block {
            bail!(
                "ciphertext buffer too small: {} bytes for {} bytes of payload",
                out.len(),
                input.len()
            );
        }
        let Some(ctx) = self.enc.as_mut() else {
            bail!("encrypt context missing");
        };

        let mut iv = [0u8; IV_LEN];
        build_iv(iv_seed, &mut iv[..self.enc_iv_len]);
        ctx.set_iv(&iv);
        self.enc_stream.reset();

        *rtp_padding = input.len() % self.enc_block != 0;
        ctx.set_padding(*rtp_padding);

        // Partial trailing blocks always go out padded: the stealing
        // construction is not interoperable when sent, so this arm is
        // kept only for symmetry with the receive path.
        let written = if !*rtp_padding && input.len() % self.enc_block != 0 {
            let n = self.enc_stream.update_cts(ctx, out, input)?;
            n + self.enc_stream.finalize_cts_encrypt(ctx, &mut out[n..])?
        } else {
            let n = self.enc_stream.update(ctx, out, input)?;
            n + self.enc_stream.finalize_encrypt(ctx, &mut out[n..])?
        };

        self.operations += 1;
        Ok(written)
    }

    /// Decrypt `input` into `out`, returning the plaintext length.
    ///
    /// `rtp_padding` carries the peer's RTP padding bit in, and is
    /// always false on return — the produced length already excludes
    /// any padding.
    pub fn decrypt_into(
        &mut self,
        input: &[u8],
        out: &mut [u8],
        iv_seed: Option<&[u8; IV_SEQUENCE_LEN]>,
        rtp_padding: &mut bool,
    ) -> Result<usize> {
        if !self.initialized {
            tracing::debug!("decrypt on an unkeyed engine");
            *rtp_padding = false;
            return Ok(0);
        }
        if out.len() < input.len() + self.dec_block {
            bail!(
                "plaintext buffer too small: {} bytes for {} bytes of payload",
                out.len(),
                input.len()
            );
        }
        let Some(ctx) = self.dec.as_mut() else {
            bail!("decrypt context missing");
        };

        let mut iv = [0u8; IV_LEN];
        build_iv(iv_seed, &mut iv[..self.dec_iv_len]);
        ctx.set_iv(&iv);
        self.dec_stream.reset();

        ctx.set_padding(*rtp_padding);

        let written = if !*rtp_padding && input.len() % self.dec_block != 0 {
            let n = self.dec_stream.update_cts(ctx, out, input)?;
            n + self.dec_stream.finalize_cts_decrypt(ctx, &mut out[n..])?
        } else {
            let n = self.dec_stream.update_decrypt(ctx, out, input)?;
            n + self.dec_stream.finalize_decrypt_relaxed(ctx, &mut out[n..])?
        };

        *rtp_padding = false;
        self.operations += 1;
        Ok(written)
    }

    /// Allocating wrapper over [`Self::encrypt_into`].
    pub fn encrypt(
        &mut self,
        input: &[u8],
        iv_seed: Option<&[u8; IV_SEQUENCE_LEN]>,
        rtp_padding: &mut bool,
    ) -> Result<Vec<u8>> {
        let mut out = vec![0u8; input.len() + BLOCK_SIZE];
        let n = self.encrypt_into(input, &mut out, iv_seed, rtp_padding)?;
        out.truncate(n);
        Ok(out)
    }

    /// Allocating wrapper over [`Self::decrypt_into`].
    pub fn decrypt(
        &mut self,
        input: &[u8],
        iv_seed: Option<&[u8; IV_SEQUENCE_LEN]>,
        rtp_padding: &mut bool,
    ) -> Result<Vec<u8>> {
        let mut out = vec![0u8; input.len() + BLOCK_SIZE];
        let n = self.decrypt_into(input, &mut out, iv_seed, rtp_padding)?;
        out.truncate(n);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{BlockCipher, Direction, Mode};
    use crate::stream::CipherStream;
    use rand::rngs::mock::StepRng;

    fn zero_key_engine() -> CryptoEngine {
        CryptoEngine::with_key(ID_AES128, &[0u8; 16])
    }

    #[test]
    fn test_iv_tiling() {
        let seed = [0x10, 0x20, 0x30, 0x40, 0x50, 0x60];
        let mut iv = [0u8; IV_LEN];
        build_iv(Some(&seed), &mut iv);
        for (i, b) in iv.iter().enumerate() {
            assert_eq!(*b, seed[i % IV_SEQUENCE_LEN], "iv byte {}", i);
        }

        build_iv(None, &mut iv);
        assert_eq!(iv, [0u8; IV_LEN]);
    }

    #[test]
    fn test_key_length_mapping() {
        let mut rng = StepRng::new(1, 1);
        assert_eq!(random_key_for_oid(ID_AES128, &mut rng).len(), 16);
        assert_eq!(random_key_for_oid(ID_AES192, &mut rng).len(), 24);
        assert_eq!(random_key_for_oid(ID_AES256, &mut rng).len(), 32);
        assert!(random_key_for_oid("1.2.3.4", &mut rng).is_empty());
    }

    #[test]
    fn test_padded_roundtrip() {
        // 10 bytes force a padded single-block ciphertext.
        let mut engine = zero_key_engine();
        let seed = [0x00, 0x01, 0x00, 0x00, 0x00, 0x00];
        let plaintext = b"HelloWorld";

        let mut padding = false;
        let ciphertext = engine.encrypt(plaintext, Some(&seed), &mut padding).unwrap();
        assert_eq!(ciphertext.len(), 16);
        assert!(padding);

        let back = engine.decrypt(&ciphertext, Some(&seed), &mut padding).unwrap();
        assert_eq!(back, plaintext);
        assert!(!padding);
    }

    #[test]
    fn test_block_aligned_matches_raw_cbc() {
        let mut engine = zero_key_engine();
        let seed = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        let plaintext = [0x41u8; 32];

        let mut padding = true;
        let ciphertext = engine.encrypt(&plaintext, Some(&seed), &mut padding).unwrap();
        assert_eq!(ciphertext.len(), 32);
        assert!(!padding);

        // Aligned payloads are plain CBC with the tiled IV, nothing added.
        let mut iv = [0u8; IV_LEN];
        build_iv(Some(&seed), &mut iv);
        let mut raw = BlockCipher::new(&[0u8; 16], Mode::Cbc, Direction::Encrypt).unwrap();
        raw.set_iv(&iv);
        let mut expected = [0u8; 32];
        raw.process(&plaintext, &mut expected).unwrap();
        assert_eq!(ciphertext, expected);

        let back = engine.decrypt(&ciphertext, Some(&seed), &mut padding).unwrap();
        assert_eq!(back, plaintext);
    }

    #[test]
    fn test_cts_decrypt_path() {
        // The engine never *sends* stolen-tail ciphertext, but must
        // accept it: produce one at the stream layer and hand it to
        // the engine with the padding bit clear.
        let key = [0x13u8; 16];
        let seed = [1, 2, 3, 4, 5, 6];
        let plaintext: Vec<u8> = (0u8..20).collect();

        let mut iv = [0u8; IV_LEN];
        build_iv(Some(&seed), &mut iv);
        let mut ctx = BlockCipher::new(&key, Mode::Cbc, Direction::Encrypt).unwrap();
        ctx.set_iv(&iv);
        let mut stream = CipherStream::new();
        let mut ciphertext = vec![0u8; 36];
        let mut n = stream.update_cts(&mut ctx, &mut ciphertext, &plaintext).unwrap();
        n += stream
            .finalize_cts_encrypt(&mut ctx, &mut ciphertext[n..])
            .unwrap();
        ciphertext.truncate(n);
        assert_eq!(ciphertext.len(), plaintext.len());

        let mut engine = CryptoEngine::with_key(ID_AES128, &key);
        let mut padding = false;
        let back = engine.decrypt(&ciphertext, Some(&seed), &mut padding).unwrap();
        assert_eq!(back, plaintext);
        assert!(!padding);
    }

    #[test]
    fn test_relaxed_depad_accepts_garbage_interior() {
        // Last plaintext block ends ...99 88 03: three bytes of
        // "padding" of which only the final length byte is right.
        let mut engine = zero_key_engine();
        let seed = [9, 9, 9, 9, 9, 9];
        let mut block: Vec<u8> = (0u8..13).collect();
        block.extend_from_slice(&[0x99, 0x88, 0x03]);

        let mut padding = false;
        let ciphertext = engine.encrypt(&block, Some(&seed), &mut padding).unwrap();
        assert!(!padding); // aligned, sent as-is

        let mut padding = true;
        let back = engine.decrypt(&ciphertext, Some(&seed), &mut padding).unwrap();
        assert_eq!(back, &block[..13]);
    }

    #[test]
    fn test_depad_rejects_bad_length_byte() {
        let mut engine = zero_key_engine();
        let seed = [7, 7, 7, 7, 7, 7];
        for last in [0x00u8, 0x11] {
            let mut block: Vec<u8> = (0u8..15).collect();
            block.push(last);

            let mut padding = false;
            let ciphertext = engine.encrypt(&block, Some(&seed), &mut padding).unwrap();

            let mut padding = true;
            assert!(
                engine.decrypt(&ciphertext, Some(&seed), &mut padding).is_err(),
                "length byte {:#04x} accepted",
                last
            );
        }
    }

    #[test]
    fn test_unaligned_no_padding_too_short_fails() {
        // A stolen-tail ciphertext needs at least one full block plus
        // a fragment; a lone fragment has nowhere to steal from.
        let mut engine = zero_key_engine();
        let mut padding = false;
        assert!(engine
            .decrypt(&[0u8; 10], Some(&[0; 6]), &mut padding)
            .is_err());
    }

    #[test]
    fn test_operation_counter() {
        let mut engine = zero_key_engine();
        assert_eq!(engine.operation_count(), 0);

        let mut padding = false;
        let ct = engine.encrypt(b"abc", Some(&[0; 6]), &mut padding).unwrap();
        assert_eq!(engine.operation_count(), 1);
        let mut padding = true;
        engine.decrypt(&ct, Some(&[0; 6]), &mut padding).unwrap();
        assert_eq!(engine.operation_count(), 2);

        // Failed operations don't count.
        let mut padding = true;
        let _ = engine.decrypt(&[0u8; 8], Some(&[0; 6]), &mut padding);
        assert_eq!(engine.operation_count(), 2);

        // Rekey resets.
        engine.set_key(&[1u8; 16]);
        assert_eq!(engine.operation_count(), 0);
    }

    #[test]
    fn test_unknown_oid_stays_unkeyed() {
        let mut engine = CryptoEngine::with_key("1.2.3.4", &[0u8; 16]);
        assert!(!engine.is_initialized());

        let mut padding = false;
        let out = engine.encrypt(b"payload", Some(&[0; 6]), &mut padding).unwrap();
        assert!(out.is_empty());
        assert_eq!(engine.operation_count(), 0);
    }

    #[test]
    fn test_wrong_key_length_stays_unkeyed() {
        let engine = CryptoEngine::with_key(ID_AES128, &[0u8; 24]);
        assert!(!engine.is_initialized());
    }

    #[test]
    fn test_generate_random_key_installs_itself() {
        let mut engine = CryptoEngine::new(ID_AES128);
        assert!(!engine.is_initialized());

        let key = engine.generate_random_key();
        assert_eq!(key.len(), 16);
        assert!(engine.is_initialized());

        // A second engine keyed with the returned bytes interoperates.
        let mut peer = CryptoEngine::with_key(ID_AES128, &key);
        let seed = [0, 42, 0, 0, 0xAB, 0xCD];
        let mut padding = false;
        let ct = engine.encrypt(b"one frame", Some(&seed), &mut padding).unwrap();
        let mut flag = padding;
        let back = peer.decrypt(&ct, Some(&seed), &mut flag).unwrap();
        assert_eq!(back, b"one frame");
    }

    #[test]
    fn test_random_keys_differ() {
        let mut a = CryptoEngine::new(ID_AES256);
        let mut b = CryptoEngine::new(ID_AES256);
        assert_ne!(a.generate_random_key(), b.generate_random_key());
    }

    #[test]
    fn test_empty_payload() {
        let mut engine = zero_key_engine();
        let mut padding = true;
        let ct = engine.encrypt(&[], Some(&[0; 6]), &mut padding).unwrap();
        assert!(ct.is_empty());
        assert!(!padding);

        let mut padding = false;
        let back = engine.decrypt(&[], Some(&[0; 6]), &mut padding).unwrap();
        assert!(back.is_empty());
    }
}
