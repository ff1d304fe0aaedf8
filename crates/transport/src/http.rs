//! HTTP delivery transport
//!
//! Delivers payloads as JSON POSTs to a configured ingest endpoint,
//! authenticating each request with the account's basic-auth credentials.
//! HTTP is stateless, so `connect` only materializes a session handle
//! carrying the credentials; the remote's reply status becomes the reply
//! code the engine classifies on.

use std::time::Duration;

use tracing::debug;

use crate::{
    AccountCredentials, BoxFuture, Payload, Receipt, Session, Transport, TransportError,
};

/// Longest rejection body echoed back into an error message.
const REJECTION_SNIPPET_LEN: usize = 200;

/// JSON-over-HTTP delivery to a single ingest endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

impl Transport for HttpTransport {
    fn id(&self) -> &str {
        "http"
    }

    fn connect<'a>(
        &'a self,
        credentials: &'a AccountCredentials,
    ) -> BoxFuture<'a, Result<Box<dyn Session>, TransportError>> {
        Box::pin(async move {
            if credentials.login.is_empty() {
                return Err(TransportError::Connect("empty login".into()));
            }
            debug!(account = %credentials.login, endpoint = %self.endpoint, "http session opened");
            Ok(Box::new(HttpSession {
                client: self.client.clone(),
                endpoint: self.endpoint.clone(),
                timeout: self.timeout,
                credentials: credentials.clone(),
            }) as Box<dyn Session>)
        })
    }
}

struct HttpSession {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    credentials: AccountCredentials,
}

impl Session for HttpSession {
    fn send<'a>(
        &'a mut self,
        payload: &'a Payload,
    ) -> BoxFuture<'a, Result<Receipt, TransportError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .basic_auth(
                    &self.credentials.login,
                    Some(self.credentials.secret.expose()),
                )
                .timeout(self.timeout)
                .json(payload)
                .send()
                .await
                .map_err(|e| TransportError::Disconnected(e.to_string()))?;

            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            if status.is_success() {
                let detail = if body.trim().is_empty() {
                    "accepted".to_string()
                } else {
                    body.trim().to_string()
                };
                return Ok(Receipt { detail });
            }

            let message: String = body.trim().chars().take(REJECTION_SNIPPET_LEN).collect();
            Err(TransportError::Rejected {
                code: status.as_u16(),
                message,
            })
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        // Nothing to tear down for a stateless protocol.
        Box::pin(async {})
    }
}
