//! H.235 media encryption for RTP streams.
//!
//! AES-CBC payload encryption as negotiated by H.323 endpoints under
//! the H.235v3 baseline profile: a Diffie-Hellman-derived wrapping key
//! carries a randomly generated media master key to the peer, and the
//! master key then encrypts every RTP payload of the call with a
//! per-frame IV built from the sequence number and timestamp.
//!
//! Payloads that do not fill the last cipher block are PKCS-padded
//! (signalled through the RTP padding bit); unpadded non-aligned
//! payloads from the peer are handled with ciphertext stealing.
//! Depadding is deliberately lenient about interior padding bytes to
//! stay interoperable with endpoints that fill them incorrectly, and a
//! frame that fails to decrypt is dropped without disturbing the rest
//! of the stream. The profile carries no authentication tag; this
//! layer offers confidentiality only.
//!
//! Layering, bottom up: [`cipher`] is the raw AES block transform with
//! chaining state, [`stream`] adds the partial-block buffering and the
//! stealing/depadding constructions, [`engine`] handles keys and
//! per-frame IVs, and [`session`] binds two engines to a call.

pub mod cipher;
pub mod engine;
pub mod rtp;
pub mod session;
pub mod stream;

pub use engine::{CryptoEngine, ID_AES128, ID_AES192, ID_AES256};
pub use rtp::RtpFrame;
pub use session::{MediaSession, SharedSecretSource};
