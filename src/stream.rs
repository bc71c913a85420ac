//! Streaming adapter over the one-shot block transform.
//!
//! RTP payloads arrive in arbitrary sizes, so the cipher layer keeps a
//! partial-block buffer between calls and a one-block lookahead buffer
//! that defers emission of the most recent output block. The lookahead
//! is what makes two H.235 oddities possible:
//!
//! - on decrypt, finalize gets to inspect the trailing block and strip
//!   PKCS-style padding *leniently* (only the final length byte is
//!   validated — several deployed endpoints fill the interior padding
//!   bytes with garbage);
//! - for non-block-aligned payloads sent without padding, the last two
//!   blocks are exchanged via ciphertext stealing, so the trailing full
//!   block must be withheld until the fractional tail is known.
//!
//! The buffer knows nothing about keys, IVs or RTP; it only drives a
//! [`BlockCipher`] and accounts for bytes.

use anyhow::{bail, Result};

use crate::cipher::{BlockCipher, Direction, Mode, BLOCK_SIZE};

/// Partial-block and lookahead state for one direction of one stream.
///
/// Created zeroed; `reset()` before each frame.
#[derive(Default)]
pub struct CipherStream {
    /// Residual input bytes, fewer than one block outside of CTS runs.
    buf: [u8; BLOCK_SIZE],
    buf_len: usize,
    /// The withheld block: produced-but-not-emitted output on the
    /// padded decrypt path, or the pending next-to-last input block on
    /// the CTS path.
    last: [u8; BLOCK_SIZE],
    last_used: bool,
}

impl CipherStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all buffered state ahead of a new frame.
    pub fn reset(&mut self) {
        self.buf_len = 0;
        self.last_used = false;
    }

    /// Consume `input`, emit complete blocks to `out`, retain the
    /// non-aligned tail. Returns the number of bytes written.
    ///
    /// Used directly for encryption and for no-padding decryption; the
    /// padded decrypt path wraps it with [`Self::update_decrypt`].
    pub fn update(
        &mut self,
        ctx: &mut BlockCipher,
        out: &mut [u8],
        input: &[u8],
    ) -> Result<usize> {
        if input.is_empty() {
            return Ok(0);
        }
        let bl = ctx.block_size();

        // Fast path: nothing buffered and the input is block-aligned.
        if self.buf_len == 0 && input.len() % bl == 0 {
            ctx.process(input, out)?;
            return Ok(input.len());
        }

        let mut input = input;
        let mut written = 0;

        if self.buf_len != 0 {
            if self.buf_len + input.len() < bl {
                self.buf[self.buf_len..self.buf_len + input.len()].copy_from_slice(input);
                self.buf_len += input.len();
                return Ok(0);
            }
            let take = bl - self.buf_len;
            self.buf[self.buf_len..bl].copy_from_slice(&input[..take]);
            ctx.process(&self.buf[..bl], &mut out[..bl])?;
            input = &input[take..];
            written = bl;
        }

        let tail = input.len() % bl;
        let bulk = input.len() - tail;
        if bulk > 0 {
            ctx.process(&input[..bulk], &mut out[written..written + bulk])?;
            written += bulk;
        }
        if tail != 0 {
            self.buf[..tail].copy_from_slice(&input[bulk..]);
        }
        self.buf_len = tail;
        Ok(written)
    }

    /// Decrypt-side `update` that withholds the most recent output
    /// block so that finalize can depad it.
    ///
    /// The padding flag comes from the peer and is untrusted, so the
    /// block is withheld whenever padding is expected, never skipped on
    /// a hunch. Without padding this is a plain [`Self::update`].
    pub fn update_decrypt(
        &mut self,
        ctx: &mut BlockCipher,
        out: &mut [u8],
        input: &[u8],
    ) -> Result<usize> {
        if input.is_empty() {
            return Ok(0);
        }
        if !ctx.padding() {
            return self.update(ctx, out, input);
        }
        let bl = ctx.block_size();

        // Emit the block withheld by the previous call, if any.
        let mut deferred = false;
        let mut offset = 0;
        if self.last_used {
            out[..bl].copy_from_slice(&self.last);
            offset = bl;
            deferred = true;
        }

        let mut written = self.update(ctx, &mut out[offset..], input)?;

        if self.buf_len == 0 {
            // Output ended block-aligned: withhold the trailing block.
            written -= bl;
            self.last
                .copy_from_slice(&out[offset + written..offset + written + bl]);
            self.last_used = true;
        } else {
            self.last_used = false;
        }

        if deferred {
            written += bl;
        }
        Ok(written)
    }

    /// Finish an encryption run, emitting the PKCS-padded final block
    /// when padding is enabled on the context.
    pub fn finalize_encrypt(&mut self, ctx: &mut BlockCipher, out: &mut [u8]) -> Result<usize> {
        let bl = ctx.block_size();
        if !ctx.padding() {
            if self.buf_len != 0 {
                bail!("plaintext not a multiple of the block length");
            }
            return Ok(0);
        }

        let pad = (bl - self.buf_len) as u8;
        for b in &mut self.buf[self.buf_len..bl] {
            *b = pad;
        }
        ctx.process(&self.buf[..bl], &mut out[..bl])?;
        self.buf_len = 0;
        Ok(bl)
    }

    /// Finish a padded decryption run, stripping PKCS-style padding
    /// from the withheld block.
    ///
    /// Only the final padding-length byte is validated. The interior
    /// padding bytes are accepted as-is: Polycom m100 and PVX fill
    /// them incorrectly, and rejecting their frames kills the call.
    pub fn finalize_decrypt_relaxed(
        &mut self,
        ctx: &mut BlockCipher,
        out: &mut [u8],
    ) -> Result<usize> {
        if !ctx.padding() {
            if self.buf_len != 0 {
                bail!("ciphertext not a multiple of the block length");
            }
            return Ok(0);
        }

        let bl = ctx.block_size();
        if self.buf_len != 0 || !self.last_used {
            bail!("wrong final block length");
        }
        let pad = self.last[bl - 1] as usize;
        if pad == 0 || pad > bl {
            bail!("bad padding length byte {:#04x}", self.last[bl - 1]);
        }
        let n = bl - pad;
        out[..n].copy_from_slice(&self.last[..n]);
        Ok(n)
    }

    /// `update` variant for ciphertext stealing, in either direction.
    ///
    /// Keeps a two-block trailing window: `last` holds the most recent
    /// full input block and `buf` the fractional (or exactly full)
    /// tail after it. Neither is emitted until finalize exchanges
    /// bytes between them.
    pub fn update_cts(
        &mut self,
        ctx: &mut BlockCipher,
        out: &mut [u8],
        input: &[u8],
    ) -> Result<usize> {
        if input.is_empty() {
            return Ok(0);
        }
        let bl = ctx.block_size();

        if self.buf_len + input.len() <= bl {
            self.buf[self.buf_len..self.buf_len + input.len()].copy_from_slice(input);
            self.buf_len += input.len();
            return Ok(0);
        }

        // More than one block pending in total: the withheld block is
        // no longer the trailing one, emit it.
        let mut written = 0;
        if self.last_used {
            ctx.process(&self.last[..bl], &mut out[..bl])?;
            written = bl;
            self.last_used = false;
        }

        let take = bl - self.buf_len;
        self.buf[self.buf_len..bl].copy_from_slice(&input[..take]);
        let input = &input[take..];
        self.buf_len = bl;

        if input.len() <= bl {
            self.last[..bl].copy_from_slice(&self.buf[..bl]);
            self.last_used = true;
            self.buf[..input.len()].copy_from_slice(input);
            self.buf_len = input.len();
            return Ok(written);
        }

        ctx.process(&self.buf[..bl], &mut out[written..written + bl])?;
        written += bl;
        self.buf_len = 0;

        // Stash the trailing full block and the tail after it; the
        // tail may itself be exactly one block when the input ends
        // aligned.
        let leftover = input.len() % bl;
        let bulk = if leftover != 0 {
            self.buf[..leftover].copy_from_slice(&input[input.len() - leftover..]);
            self.buf_len = leftover;
            input.len() - bl - leftover
        } else {
            self.buf[..bl].copy_from_slice(&input[input.len() - bl..]);
            self.buf_len = bl;
            input.len() - 2 * bl
        };
        self.last[..bl].copy_from_slice(&input[bulk..bulk + bl]);
        self.last_used = true;

        if bulk > 0 {
            ctx.process(&input[..bulk], &mut out[written..written + bulk])?;
            written += bulk;
        }
        Ok(written)
    }

    /// Finish an encryption run by stealing ciphertext between the two
    /// pending blocks. Emits one full block followed by the short
    /// block; total output equals total input.
    pub fn finalize_cts_encrypt(
        &mut self,
        ctx: &mut BlockCipher,
        out: &mut [u8],
    ) -> Result<usize> {
        if ctx.direction() != Direction::Encrypt {
            bail!("stealing finalize on a decrypt context");
        }
        let bl = ctx.block_size();
        if !self.last_used {
            bail!("stealing finalize without a pending block");
        }
        if self.buf_len == 0 {
            bail!("stealing finalize without trailing plaintext");
        }
        let leftover = self.buf_len;

        let mut tmp = [0u8; BLOCK_SIZE];
        // C' = cipher of the next-to-last plaintext block; its head
        // becomes the short final block, its tail is stolen.
        ctx.process(&self.last[..bl], &mut tmp[..bl])?;

        match ctx.mode() {
            Mode::Ecb => {
                // P_n ‖ tail(C') -> cipher -> emitted C_{n-1}
                self.buf[leftover..bl].copy_from_slice(&tmp[leftover..bl]);
            }
            Mode::Cbc => {
                // P_n ‖ 0s; the chaining XOR with C' supplies the
                // stolen tail.
                for b in &mut self.buf[leftover..bl] {
                    *b = 0;
                }
            }
        }
        ctx.process(&self.buf[..bl], &mut out[..bl])?;
        out[bl..bl + leftover].copy_from_slice(&tmp[..leftover]);
        Ok(bl + leftover)
    }

    /// Finish a decryption run over a stolen-tail ciphertext.
    ///
    /// The CBC arm has to unwind the chaining by hand: the swap breaks
    /// the natural block order, so the second-to-last ciphertext block
    /// is taken from the context's current chaining IV and XORed back
    /// out explicitly.
    pub fn finalize_cts_decrypt(
        &mut self,
        ctx: &mut BlockCipher,
        out: &mut [u8],
    ) -> Result<usize> {
        if ctx.direction() != Direction::Decrypt {
            bail!("stealing finalize on an encrypt context");
        }
        let bl = ctx.block_size();
        if !self.last_used {
            bail!("stealing finalize without a pending block");
        }
        if self.buf_len == 0 {
            bail!("stealing finalize without trailing ciphertext");
        }
        let leftover = self.buf_len;

        let mut tmp = [0u8; BLOCK_SIZE];
        match ctx.mode() {
            Mode::Ecb => {
                // decipher C_{n-1} => P_n ‖ C'
                ctx.process(&self.last[..bl], &mut tmp[..bl])?;
                // C_n ‖ C' -> decipher -> P_{n-1}
                self.buf[leftover..bl].copy_from_slice(&tmp[leftover..bl]);
                ctx.process(&self.buf[..bl], &mut out[..bl])?;
                out[bl..bl + leftover].copy_from_slice(&tmp[..leftover]);
            }
            Mode::Cbc => {
                let c_n_minus_2 = *ctx.iv();

                // C_n ‖ 0s
                for b in &mut self.buf[leftover..bl] {
                    *b = 0;
                }

                // decipher C_{n-1}, then strip the automatic chaining
                // XOR and fold in C_n ‖ 0s => P_n ‖ C'
                ctx.process(&self.last[..bl], &mut tmp[..bl])?;
                for (t, c) in tmp.iter_mut().zip(c_n_minus_2.iter()) {
                    *t ^= c;
                }
                for (t, b) in tmp.iter_mut().zip(self.buf.iter()) {
                    *t ^= b;
                }

                // reassemble C_n ‖ C', decipher, strip the chaining XOR
                // with C_{n-1}, re-apply C_{n-2} => P_{n-1}
                self.buf[leftover..bl].copy_from_slice(&tmp[leftover..bl]);
                ctx.process(&self.buf[..bl], &mut out[..bl])?;
                for (o, l) in out[..bl].iter_mut().zip(self.last.iter()) {
                    *o ^= l;
                }
                for (o, c) in out[..bl].iter_mut().zip(c_n_minus_2.iter()) {
                    *o ^= c;
                }

                out[bl..bl + leftover].copy_from_slice(&tmp[..leftover]);
            }
        }
        Ok(bl + leftover)
    }
}
