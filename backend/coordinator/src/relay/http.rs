use async_trait::async_trait;
use reqwest::StatusCode;
use shared::{ CompletionNotice, Envelope, SetupRecord };
use tracing::debug;

use crate::config::RelayConfig;
use crate::error::KeysignError;
use crate::relay::Relay;

const MESSAGE_ID_HEADER: &str = "message_id";

/// Stateless HTTP client for the mediator API.
#[derive(Clone)]
pub struct HttpRelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRelayClient {
    pub fn new(config: &RelayConfig) -> Result<Self, KeysignError> {
        let http = reqwest::Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, KeysignError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(KeysignError::Transport {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Relay for HttpRelayClient {
    async fn publish(
        &self,
        session_id: &str,
        message_id: &str,
        envelope: &Envelope
    ) -> Result<(), KeysignError> {
        let url = format!("{}/message/{}/{}", self.base_url, session_id, envelope.to);
        let response = self.http
            .post(url)
            .header(MESSAGE_ID_HEADER, message_id)
            .json(envelope)
            .send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn poll(
        &self,
        session_id: &str,
        party_id: &str,
        message_id: &str
    ) -> Result<Vec<Envelope>, KeysignError> {
        let url = format!("{}/message/{}/{}", self.base_url, session_id, party_id);
        let response = self.http.get(url).header(MESSAGE_ID_HEADER, message_id).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = Self::check(response).await?;
        Ok(response.json::<Vec<Envelope>>().await?)
    }

    async fn acknowledge(
        &self,
        session_id: &str,
        party_id: &str,
        hash: &str,
        message_id: &str
    ) -> Result<(), KeysignError> {
        let url = format!("{}/message/{}/{}/{}", self.base_url, session_id, party_id, hash);
        let response = self.http
            .delete(url)
            .header(MESSAGE_ID_HEADER, message_id)
            .send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn post_setup(
        &self,
        session_id: &str,
        message_id: &str,
        payload: &str
    ) -> Result<(), KeysignError> {
        let record = SetupRecord {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            payload: payload.to_string(),
        };
        let url = format!("{}/setup/{}", self.base_url, session_id);
        let response = self.http
            .post(url)
            .header(MESSAGE_ID_HEADER, message_id)
            .json(&record)
            .send().await?;
        Self::check(response).await?;
        debug!(session_id, "setup message published");
        Ok(())
    }

    async fn fetch_setup(
        &self,
        session_id: &str,
        message_id: &str
    ) -> Result<Option<String>, KeysignError> {
        let url = format!("{}/setup/{}", self.base_url, session_id);
        let response = self.http.get(url).header(MESSAGE_ID_HEADER, message_id).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        let record = response.json::<SetupRecord>().await?;
        Ok(Some(record.payload))
    }

    async fn report_completion(
        &self,
        session_id: &str,
        notice: &CompletionNotice
    ) -> Result<(), KeysignError> {
        let url = format!("{}/complete/{}", self.base_url, session_id);
        let response = self.http.post(url).json(notice).send().await?;
        Self::check(response).await?;
        Ok(())
    }
}
