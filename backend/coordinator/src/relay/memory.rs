use async_trait::async_trait;
use shared::{ CompletionNotice, Envelope };
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::KeysignError;
use crate::relay::Relay;

/// In-process relay with the same at-least-once semantics as the mediator.
///
/// Useful for driving a full multi-party ceremony inside one process:
/// local integration tests, simulators, and same-host multi-device demos.
/// Envelopes stay in the inbox until acknowledged by hash, exactly like
/// the HTTP mediator.
#[derive(Default)]
pub struct MemoryRelay {
    state: Mutex<MemoryRelayState>,
}

#[derive(Default)]
struct MemoryRelayState {
    // (session, party, message_id) -> inbox
    inboxes: HashMap<(String, String, String), Vec<Envelope>>,
    // (session, message_id) -> setup payload
    setups: HashMap<(String, String), String>,
    completions: Vec<(String, CompletionNotice)>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completion notices received so far, for assertions in tests.
    pub fn completions(&self) -> Vec<CompletionNotice> {
        let state = self.state.lock().expect("memory relay lock");
        state.completions
            .iter()
            .map(|(_, notice)| notice.clone())
            .collect()
    }

    /// Drops the stored setup payload, simulating an initiator that has
    /// not published yet.
    pub fn clear_setup(&self, session_id: &str, message_id: &str) {
        let mut state = self.state.lock().expect("memory relay lock");
        state.setups.remove(&(session_id.to_string(), message_id.to_string()));
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn publish(
        &self,
        session_id: &str,
        message_id: &str,
        envelope: &Envelope
    ) -> Result<(), KeysignError> {
        let mut state = self.state.lock().expect("memory relay lock");
        state.inboxes
            .entry((session_id.to_string(), envelope.to.clone(), message_id.to_string()))
            .or_default()
            .push(envelope.clone());
        Ok(())
    }

    async fn poll(
        &self,
        session_id: &str,
        party_id: &str,
        message_id: &str
    ) -> Result<Vec<Envelope>, KeysignError> {
        let state = self.state.lock().expect("memory relay lock");
        Ok(
            state.inboxes
                .get(&(session_id.to_string(), party_id.to_string(), message_id.to_string()))
                .cloned()
                .unwrap_or_default()
        )
    }

    async fn acknowledge(
        &self,
        session_id: &str,
        party_id: &str,
        hash: &str,
        message_id: &str
    ) -> Result<(), KeysignError> {
        let mut state = self.state.lock().expect("memory relay lock");
        if
            let Some(inbox) = state.inboxes.get_mut(
                &(session_id.to_string(), party_id.to_string(), message_id.to_string())
            )
        {
            inbox.retain(|envelope| envelope.hash != hash);
        }
        Ok(())
    }

    async fn post_setup(
        &self,
        session_id: &str,
        message_id: &str,
        payload: &str
    ) -> Result<(), KeysignError> {
        let mut state = self.state.lock().expect("memory relay lock");
        state.setups.insert(
            (session_id.to_string(), message_id.to_string()),
            payload.to_string()
        );
        Ok(())
    }

    async fn fetch_setup(
        &self,
        session_id: &str,
        message_id: &str
    ) -> Result<Option<String>, KeysignError> {
        let state = self.state.lock().expect("memory relay lock");
        Ok(state.setups.get(&(session_id.to_string(), message_id.to_string())).cloned())
    }

    async fn report_completion(
        &self,
        session_id: &str,
        notice: &CompletionNotice
    ) -> Result<(), KeysignError> {
        let mut state = self.state.lock().expect("memory relay lock");
        state.completions.push((session_id.to_string(), notice.clone()));
        Ok(())
    }
}
