use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::config::{self, CoreConfig};
use crate::error::TransportError;
use crate::keys::IdentityPublicKey;
use crate::passkey::{AssertionResponse, AttestationResponse};
use crate::transport::{
    LoginChallenge, PeerKeyRecord, RegistrationChallenge, RegistrationRequest, TokenGrant,
    TransferReceipt, TransferSubmission, Transport,
};

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(config: &CoreConfig) -> Result<Self, TransportError> {
        config
            .validate()
            .map_err(|e| TransportError::Network(format!("{e:#}")))?;
        let base_url = config
            .api_url()
            .map_err(|e| TransportError::Network(format!("{e:#}")))?;
        if base_url.cannot_be_a_base() {
            return Err(TransportError::Network(format!(
                "api_base_url cannot be a base: {base_url}"
            )));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("eupay-core/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout())
            .https_only(!config::is_loopback_http(&base_url))
            .build()
            .map_err(|e| TransportError::Network(format!("client init: {e}")))?;
        Ok(Self { client, base_url })
    }

    /// Base URL with `segments` appended, each percent-encoded as a single
    /// path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| TransportError::Network(format!("bad base url {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Map non-success statuses; 401 and 403 both drive the refresh cycle.
async fn check_status(res: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = res.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(TransportError::Unauthorized);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(TransportError::NotFound(res.url().path().to_string()));
    }
    if !status.is_success() {
        let message = res.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            status: status.as_u16(),
            message: message.chars().take(200).collect(),
        });
    }
    Ok(res)
}

async fn decode<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, TransportError> {
    check_status(res)
        .await?
        .json::<T>()
        .await
        .map_err(|e| TransportError::Decode(e.to_string()))
}

fn network(err: reqwest::Error) -> TransportError {
    TransportError::Network(err.to_string())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_peer_key(
        &self,
        bearer: &str,
        account_id: &str,
    ) -> Result<PeerKeyRecord, TransportError> {
        let url = self.endpoint(&["api", "p2p", "recipients", account_id, "public-key"])?;
        let res = self
            .client
            .get(url)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(network)?;
        decode(res).await
    }

    async fn submit_transfer(
        &self,
        bearer: &str,
        submission: &TransferSubmission,
    ) -> Result<TransferReceipt, TransportError> {
        let res = self
            .client
            .post(self.endpoint(&["api", "p2p", "send", "encrypted"])?)
            .bearer_auth(bearer)
            .json(submission)
            .send()
            .await
            .map_err(network)?;
        decode(res).await
    }

    async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenGrant, TransportError> {
        let res = self
            .client
            .post(self.endpoint(&["api", "auth", "refresh"])?)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(network)?;
        decode(res).await
    }

    async fn login_options(&self) -> Result<LoginChallenge, TransportError> {
        let res = self
            .client
            .post(self.endpoint(&["api", "passkey", "login", "options"])?)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(network)?;
        decode(res).await
    }

    async fn complete_login(
        &self,
        challenge_token: &str,
        assertion: &AssertionResponse,
    ) -> Result<TokenGrant, TransportError> {
        let res = self
            .client
            .post(self.endpoint(&["api", "passkey", "login"])?)
            .json(&serde_json::json!({
                "challenge_token": challenge_token,
                "credential": assertion,
            }))
            .send()
            .await
            .map_err(network)?;
        decode(res).await
    }

    async fn registration_options(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationChallenge, TransportError> {
        let res = self
            .client
            .post(self.endpoint(&["api", "passkey", "register", "options"])?)
            .json(request)
            .send()
            .await
            .map_err(network)?;
        decode(res).await
    }

    async fn complete_registration(
        &self,
        challenge_token: &str,
        attestation: &AttestationResponse,
    ) -> Result<TokenGrant, TransportError> {
        let res = self
            .client
            .post(self.endpoint(&["api", "passkey", "register"])?)
            .json(&serde_json::json!({
                "challenge_token": challenge_token,
                "credential": attestation,
            }))
            .send()
            .await
            .map_err(network)?;
        decode(res).await
    }

    async fn publish_identity(
        &self,
        bearer: &str,
        identity: &IdentityPublicKey,
    ) -> Result<(), TransportError> {
        let res = self
            .client
            .post(self.endpoint(&["api", "me", "rotate-key"])?)
            .bearer_auth(bearer)
            .json(&serde_json::json!({
                "public_key": identity.agreement,
                "identity": identity,
                "fingerprint": identity.fingerprint(),
            }))
            .send()
            .await
            .map_err(network)?;
        check_status(res).await.map(|_| ())
    }
}
