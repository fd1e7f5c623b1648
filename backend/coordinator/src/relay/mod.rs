//! Transport against the mediator: a dumb, at-least-once message store
//! addressed by `(session, party, message_id)`. The relay never sees
//! plaintext; it stores envelopes and setup payloads and forgets them when
//! the consumer acknowledges.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use shared::{ CompletionNotice, Envelope };

use crate::error::KeysignError;

pub use http::HttpRelayClient;
pub use memory::MemoryRelay;

/// The relay contract the orchestrator is written against.
///
/// All operations are plain request/response; `poll` does not block
/// server-side, the caller re-issues it in a loop. Retry policy belongs to
/// the caller, a non-2xx response surfaces as [`KeysignError::Transport`].
#[async_trait]
pub trait Relay: Send + Sync {
    /// Append one envelope to the recipient's inbox.
    async fn publish(
        &self,
        session_id: &str,
        message_id: &str,
        envelope: &Envelope
    ) -> Result<(), KeysignError>;

    /// Fetch the party's inbox without consuming it.
    async fn poll(
        &self,
        session_id: &str,
        party_id: &str,
        message_id: &str
    ) -> Result<Vec<Envelope>, KeysignError>;

    /// Consume one envelope by content hash after it has been applied.
    async fn acknowledge(
        &self,
        session_id: &str,
        party_id: &str,
        hash: &str,
        message_id: &str
    ) -> Result<(), KeysignError>;

    /// Store the ceremony setup payload (initiator only).
    async fn post_setup(
        &self,
        session_id: &str,
        message_id: &str,
        payload: &str
    ) -> Result<(), KeysignError>;

    /// Fetch the setup payload; `None` while the initiator has not
    /// published yet.
    async fn fetch_setup(
        &self,
        session_id: &str,
        message_id: &str
    ) -> Result<Option<String>, KeysignError>;

    /// Best-effort completion notice; the caller logs failures and moves on.
    async fn report_completion(
        &self,
        session_id: &str,
        notice: &CompletionNotice
    ) -> Result<(), KeysignError>;
}
