//! Keyed media session: master-key handshake and per-frame transforms.
//!
//! A session owns two engines keyed from different material. The
//! wrapping engine is keyed straight off the Diffie-Hellman shared
//! secret and used exactly once per direction, to carry the media
//! master key to the peer. The media engine is keyed with that master
//! key and transforms every RTP payload of the call.
//!
//! The endpoint that won the master/slave determination generates the
//! master key; the slave side cannot process media until the wrapped
//! key has arrived and [`MediaSession::decode_media_key`] has run —
//! until then frames pass through with an empty payload rather than
//! failing the stream.

use std::sync::Arc;

use anyhow::{bail, Result};
use zeroize::Zeroizing;

use crate::cipher::BLOCK_SIZE;
use crate::engine::{oid_key_length, CryptoEngine};
use crate::rtp::RtpFrame;

/// Provider of the Diffie-Hellman shared secret negotiated by the
/// control channel. `compute_session_key` is idempotent; the key
/// agreement itself happens elsewhere.
pub trait SharedSecretSource {
    fn compute_session_key(&self) -> Result<Vec<u8>>;
}

/// One call's media-encryption state.
pub struct MediaSession {
    dh: Arc<dyn SharedSecretSource>,
    media: CryptoEngine,
    wrap: CryptoEngine,
    master_key: Zeroizing<Vec<u8>>,
    /// Wrapping-key length: the rightmost this-many bytes of the
    /// shared secret.
    dh_key_len: usize,
    is_master: bool,
    initialized: bool,
    /// Reused per frame; grows to payload + one block as needed.
    frame_buf: Vec<u8>,
}

impl MediaSession {
    /// Create a session for the negotiated algorithm OID.
    pub fn new(dh: Arc<dyn SharedSecretSource>, oid: &str) -> Self {
        let dh_key_len = match oid_key_length(oid) {
            Some(n) => n,
            None => {
                tracing::warn!("unsupported algorithm {}", oid);
                16
            }
        };
        Self {
            dh,
            media: CryptoEngine::new(oid),
            wrap: CryptoEngine::new(oid),
            master_key: Zeroizing::new(Vec::new()),
            dh_key_len,
            is_master: false,
            initialized: false,
            frame_buf: Vec::with_capacity(1500),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    /// Key the session from the shared secret. On the master side this
    /// also generates the media master key; the slave side waits for
    /// [`Self::decode_media_key`].
    pub fn create_session(&mut self, is_master: bool) -> Result<()> {
        if self.initialized {
            bail!("session already created");
        }
        self.is_master = is_master;

        let secret = Zeroizing::new(self.dh.compute_session_key()?);
        if secret.len() < self.dh_key_len {
            bail!(
                "shared secret too short: {} bytes, need {}",
                secret.len(),
                self.dh_key_len
            );
        }
        self.wrap.set_key(&secret[secret.len() - self.dh_key_len..]);

        if is_master {
            self.master_key = Zeroizing::new(self.media.generate_random_key());
        }

        self.initialized = true;
        Ok(())
    }

    /// Wrap the media master key for transport to the peer (master
    /// side). The wrapping IV seed is all zeros by convention.
    pub fn encode_media_key(&mut self) -> Result<Vec<u8>> {
        if !self.initialized {
            bail!("session not created");
        }
        let mut padding = false;
        let wrapped = self.wrap.encrypt(&self.master_key, None, &mut padding)?;
        tracing::debug!("media master key wrapped, {} bytes", wrapped.len());
        Ok(wrapped)
    }

    /// Unwrap a received media master key and key the media engine
    /// with it (slave side).
    pub fn decode_media_key(&mut self, wrapped: &[u8]) -> Result<()> {
        if !self.initialized {
            bail!("session not created");
        }
        let mut padding = false;
        let key = Zeroizing::new(self.wrap.decrypt(wrapped, None, &mut padding)?);
        self.media.set_key(&key);
        if !self.media.is_initialized() {
            bail!("unwrapped media key rejected, {} bytes", key.len());
        }
        tracing::debug!("media master key unwrapped, {} bytes", key.len());
        self.master_key = key;
        Ok(())
    }

    /// Decrypt a received frame's payload in place.
    ///
    /// Always reports success: a frame that fails to decrypt is
    /// emptied and the stream carries on with the next one.
    pub fn read_frame(&mut self, frame: &mut RtpFrame) -> bool {
        let seed = frame.iv_seed();
        let mut padding = frame.padding();

        let needed = frame.payload().len() + BLOCK_SIZE;
        if self.frame_buf.len() < needed {
            self.frame_buf.resize(needed, 0);
        }
        let written = match self.media.decrypt_into(
            frame.payload(),
            &mut self.frame_buf,
            Some(&seed),
            &mut padding,
        ) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!("frame decrypt failed: {:#}", err);
                padding = false;
                0
            }
        };

        frame.set_payload(&self.frame_buf[..written]);
        frame.set_padding(padding);
        true
    }

    /// Encrypt an outgoing frame's payload in place, setting the RTP
    /// padding bit for the peer. Reports failure when no payload was
    /// produced.
    pub fn write_frame(&mut self, frame: &mut RtpFrame) -> bool {
        let seed = frame.iv_seed();
        let mut padding = frame.padding();

        let needed = frame.payload().len() + BLOCK_SIZE;
        if self.frame_buf.len() < needed {
            self.frame_buf.resize(needed, 0);
        }
        let written = match self.media.encrypt_into(
            frame.payload(),
            &mut self.frame_buf,
            Some(&seed),
            &mut padding,
        ) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!("frame encrypt failed: {:#}", err);
                0
            }
        };

        frame.set_payload(&self.frame_buf[..written]);
        frame.set_padding(padding);
        written > 0
    }
}
