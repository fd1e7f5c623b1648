//! Failure-path coverage for the orchestrator: retries, timeouts,
//! cancellation, deduplication and per-digest isolation, driven through a
//! scriptable engine so the behavior under test is the coordinator's, not
//! the cryptography's.

use std::sync::Arc;
use std::time::Duration;

use coordinator::engine::SigningEngine;
use coordinator::envelope;
use coordinator::keysign::{ new_session_id, CancelToken, KeysignParams };
use coordinator::relay::{ MemoryRelay, Relay };
use coordinator::{ CeremonyConfig, KeysignError };
use shared::signature::SignatureData;

mod mock {
    use std::collections::HashSet;
    use std::sync::atomic::{ AtomicI32, AtomicU32, Ordering };
    use std::sync::Arc;

    use coordinator::engine::{ EngineSession, OutboundMessage, SetupMessage, SigningEngine };
    use coordinator::KeysignError;
    use shared::signature::{ SignatureData, SignatureFamily };

    #[derive(Clone, Default)]
    pub struct Counters {
        pub opens: Arc<AtomicU32>,
        pub applies: Arc<AtomicU32>,
        /// sessions opened minus sessions dropped
        pub live: Arc<AtomicI32>,
    }

    impl Counters {
        pub fn live_sessions(&self) -> i32 {
            self.live.load(Ordering::SeqCst)
        }
    }

    /// Engine whose sessions finish, stall or fail on request.
    #[derive(Clone)]
    pub struct MockEngine {
        pub counters: Counters,
        /// every open_session call fails
        pub fail_all_opens: bool,
        /// open_session fails for this digest only
        pub fail_open_for: Option<String>,
        /// sessions never report completion
        pub never_finish: bool,
        /// sessions are complete the moment they open
        pub instant_finish: bool,
    }

    impl MockEngine {
        pub fn new() -> Self {
            Self {
                counters: Counters::default(),
                fail_all_opens: false,
                fail_open_for: None,
                never_finish: false,
                instant_finish: false,
            }
        }
    }

    impl SigningEngine for MockEngine {
        type Session = MockSession;

        fn family(&self) -> SignatureFamily {
            SignatureFamily::Eddsa
        }

        fn key_share_id(&self, _key_share: &[u8]) -> Result<Vec<u8>, KeysignError> {
            Ok(b"mock".to_vec())
        }

        fn build_setup(
            &self,
            key_share: &[u8],
            committee: &[String],
            msg_digest: &str,
            derivation_path: Option<&str>
        ) -> Result<Vec<u8>, KeysignError> {
            SetupMessage {
                key_share_id: hex::encode(self.key_share_id(key_share)?),
                committee: committee.to_vec(),
                msg_digest: msg_digest.to_string(),
                derivation_path: derivation_path.map(str::to_string),
            }.to_bytes()
        }

        fn decode_setup_digest(&self, setup: &[u8]) -> Option<Result<String, KeysignError>> {
            Some(SetupMessage::from_bytes(setup).map(|setup| setup.msg_digest))
        }

        fn open_session(
            &self,
            setup: &[u8],
            local_party_id: &str,
            _key_share: &[u8]
        ) -> Result<Self::Session, KeysignError> {
            self.counters.opens.fetch_add(1, Ordering::SeqCst);
            let setup = SetupMessage::from_bytes(setup)?;
            if self.fail_all_opens || self.fail_open_for.as_deref() == Some(&setup.msg_digest) {
                return Err(KeysignError::SessionSetup("scripted failure".to_string()));
            }
            let peers: Vec<String> = setup.committee
                .iter()
                .filter(|party| party.as_str() != local_party_id)
                .cloned()
                .collect();
            self.counters.live.fetch_add(1, Ordering::SeqCst);
            Ok(MockSession {
                peers,
                digest: setup.msg_digest,
                received: HashSet::new(),
                greeted: false,
                never_finish: self.never_finish,
                instant_finish: self.instant_finish,
                applies: Arc::clone(&self.counters.applies),
                live: Arc::clone(&self.counters.live),
            })
        }
    }

    pub struct MockSession {
        peers: Vec<String>,
        digest: String,
        received: HashSet<String>,
        greeted: bool,
        never_finish: bool,
        instant_finish: bool,
        applies: Arc<AtomicU32>,
        live: Arc<AtomicI32>,
    }

    impl Drop for MockSession {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl EngineSession for MockSession {
        fn outbound(&mut self) -> Result<Vec<OutboundMessage>, KeysignError> {
            if self.greeted {
                return Ok(Vec::new());
            }
            self.greeted = true;
            Ok(
                self.peers
                    .iter()
                    .map(|peer| OutboundMessage {
                        to: peer.clone(),
                        payload: b"hello".to_vec(),
                    })
                    .collect()
            )
        }

        fn apply(&mut self, from: &str, _message: &[u8]) -> Result<bool, KeysignError> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            self.received.insert(from.to_string());
            Ok(self.is_finished())
        }

        fn is_finished(&self) -> bool {
            if self.never_finish {
                return false;
            }
            if self.instant_finish {
                return true;
            }
            self.peers.iter().all(|peer| self.received.contains(peer))
        }

        fn finalize(self) -> Result<SignatureData, KeysignError> {
            if !self.is_finished() {
                return Err(KeysignError::Finalization("session incomplete".to_string()));
            }
            Ok(SignatureData::Eddsa {
                signature: hex::encode(self.digest.as_bytes()),
            })
        }
    }
}

const SESSION_KEY_HEX_FILL: &str = "7f";

fn params(digests: Vec<String>, is_initiator: bool) -> KeysignParams {
    KeysignParams {
        session_id: new_session_id(),
        local_party_id: "alpha".to_string(),
        committee: vec!["alpha".to_string(), "beta".to_string()],
        is_initiator,
        hex_encryption_key: SESSION_KEY_HEX_FILL.repeat(32),
        key_share: b"mock-share".to_vec(),
        messages_to_sign: digests,
        derivation_path: None,
    }
}

fn config(timeout_ms: u64, attempts: u32) -> CeremonyConfig {
    CeremonyConfig {
        exchange_timeout: Duration::from_millis(timeout_ms),
        poll_interval: Duration::from_millis(10),
        max_attempts: attempts,
    }
}

fn digest(label: &str) -> String {
    hex::encode(label.as_bytes())
}

#[tokio::test]
async fn retry_budget_is_exhausted_before_giving_up() {
    let mut engine = mock::MockEngine::new();
    engine.fail_all_opens = true;
    let relay = Arc::new(MemoryRelay::new());
    let params = params(vec![digest("doomed")], true);

    let outcome = coordinator
        ::run_ceremony(&engine, relay, &params, &config(2_000, 4), &CancelToken::new()).await
        .unwrap();

    assert!(outcome.signatures.is_empty());
    assert!(matches!(outcome.failures[&digest("doomed")], KeysignError::SessionSetup(_)));
    assert_eq!(engine.counters.opens.load(std::sync::atomic::Ordering::SeqCst), 4);
}

#[tokio::test]
async fn exchange_timeout_fires_when_peers_stay_silent() {
    let mut engine = mock::MockEngine::new();
    engine.never_finish = true;
    let relay = Arc::new(MemoryRelay::new());
    let params = params(vec![digest("silent")], true);

    let outcome = coordinator
        ::run_ceremony(&engine, relay, &params, &config(150, 2), &CancelToken::new()).await
        .unwrap();

    assert!(matches!(outcome.failures[&digest("silent")], KeysignError::CeremonyTimeout(_)));
    assert_eq!(engine.counters.live_sessions(), 0);
}

#[tokio::test]
async fn setup_digest_mismatch_fails_the_digest() {
    let engine = mock::MockEngine::new();
    let relay = Arc::new(MemoryRelay::new());
    let signed_digest = digest("published");
    let expected_digest = digest("expected");
    let params = params(vec![expected_digest.clone()], false);

    // An initiator published a setup that commits to a different digest.
    let key = envelope::session_key_from_hex(&params.hex_encryption_key).unwrap();
    let setup = engine
        .build_setup(&params.key_share, &params.committee, &signed_digest, None)
        .unwrap();
    let payload = envelope::seal_raw(&setup, &key).unwrap();
    relay.post_setup(&params.session_id, &expected_digest, &payload).await.unwrap();

    let outcome = coordinator
        ::run_ceremony(&engine, relay, &params, &config(2_000, 2), &CancelToken::new()).await
        .unwrap();

    assert!(
        matches!(outcome.failures[&expected_digest], KeysignError::SetupDigestMismatch { .. })
    );
}

#[tokio::test]
async fn one_failing_digest_does_not_abort_the_batch() {
    let mut engine = mock::MockEngine::new();
    engine.instant_finish = true;
    engine.fail_open_for = Some(digest("bad"));
    let relay = Arc::new(MemoryRelay::new());
    let params = params(vec![digest("bad"), digest("good")], true);

    let outcome = coordinator
        ::run_ceremony(&engine, relay, &params, &config(2_000, 2), &CancelToken::new()).await
        .unwrap();

    assert!(matches!(outcome.failures[&digest("bad")], KeysignError::SessionSetup(_)));
    let signature = &outcome.signatures[&digest("good")];
    assert_eq!(signature.msg_digest, digest("good"));
    assert!(matches!(signature.data, SignatureData::Eddsa { .. }));
}

#[tokio::test]
async fn cancellation_stops_the_batch_and_skips_remaining_digests() {
    let mut engine = mock::MockEngine::new();
    engine.never_finish = true;
    let relay = Arc::new(MemoryRelay::new());
    let params = params(vec![digest("first"), digest("second")], true);

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let outcome = coordinator
        ::run_ceremony(&engine, relay, &params, &config(10_000, 4), &cancel).await
        .unwrap();

    assert!(outcome.signatures.is_empty());
    assert!(matches!(outcome.failures[&digest("first")], KeysignError::Cancelled));
    assert!(!outcome.failures.contains_key(&digest("second")));
    assert_eq!(engine.counters.live_sessions(), 0);
}

#[tokio::test]
async fn redelivered_envelopes_are_applied_once() {
    let engine = mock::MockEngine::new();
    let relay = Arc::new(MemoryRelay::new());
    let params = params(vec![digest("dedup")], true);
    let key = envelope::session_key_from_hex(&params.hex_encryption_key).unwrap();

    // The same envelope lands twice, as an at-least-once relay may do.
    let sealed = envelope::seal("beta", "alpha", 0, b"hello", &key).unwrap();
    relay.publish(&params.session_id, &digest("dedup"), &sealed).await.unwrap();
    relay.publish(&params.session_id, &digest("dedup"), &sealed).await.unwrap();

    let outcome = coordinator
        ::run_ceremony(&engine, Arc::clone(&relay), &params, &config(2_000, 2), &CancelToken::new()).await
        .unwrap();

    assert!(outcome.signatures.contains_key(&digest("dedup")));
    assert_eq!(engine.counters.applies.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(engine.counters.live_sessions(), 0);
}
