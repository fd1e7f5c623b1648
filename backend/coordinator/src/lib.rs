//! Keysign coordinator for a multi-device threshold wallet.
//!
//! A signature is never produced by a single device. Each device holds an
//! opaque key-share and the committee jointly computes the signature by
//! exchanging encrypted protocol messages through an untrusted relay. This
//! crate drives that ceremony: it publishes or fetches the setup message,
//! pumps the per-family cryptographic engine, moves envelopes across the
//! relay, deduplicates at-least-once deliveries and retries failed rounds
//! within a hard wall-clock budget.
//!
//! The cryptographic rounds themselves live behind [`engine::SigningEngine`];
//! the coordinator only orders, transports and finalizes them.

pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod keysign;
pub mod logging;
pub mod relay;

pub use config::{ CeremonyConfig, RelayConfig };
pub use error::KeysignError;
pub use keysign::{ run_ceremony, CancelToken, KeysignOutcome, KeysignParams };
