//! HTTP client for the relay.
//!
//! | Method | Path | Operation |
//! |--------|------|-----------|
//! | GET | `/request/{id}` | Encrypted request left by the requester |
//! | PUT | `/response/{id}` | Encrypted answer for the requester |

use tracing::debug;
use url::Url;

use super::crypto::EncryptedPayload;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("cannot build relay URL from {0}")]
    InvalidUrl(String),

    #[error("HTTP error calling {endpoint}: {source}")]
    Http {
        endpoint: String,
        source: reqwest::Error,
    },

    #[error("relay {endpoint} returned {status}: {body}")]
    Api {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("malformed relay payload from {endpoint}: {reason}")]
    Malformed { endpoint: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
}

impl RelayClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn url(relay: &Url, kind: &str, request_id: &str) -> Result<Url, RelayError> {
        let mut url = relay.clone();
        url.path_segments_mut()
            .map_err(|_| RelayError::InvalidUrl(relay.to_string()))?
            .pop_if_empty()
            .push(kind)
            .push(request_id);
        Ok(url)
    }

    /// Calls `GET {relay}/request/{id}`.
    pub async fn get_request(&self, relay: &Url, request_id: &str) -> Result<EncryptedPayload, RelayError> {
        let url = Self::url(relay, "request", request_id)?;
        let endpoint = format!("GET {url}");
        debug!(request_id, "fetching relay request");

        let resp = self.http.get(url).send().await.map_err(|e| RelayError::Http {
            endpoint: endpoint.clone(),
            source: e,
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Api { endpoint, status, body });
        }

        resp.json().await.map_err(|e| RelayError::Malformed {
            endpoint,
            reason: e.to_string(),
        })
    }

    /// Calls `PUT {relay}/response/{id}`.
    pub async fn put_response(
        &self,
        relay: &Url,
        request_id: &str,
        body: &EncryptedPayload,
    ) -> Result<(), RelayError> {
        let url = Self::url(relay, "response", request_id)?;
        let endpoint = format!("PUT {url}");
        debug!(request_id, "sending relay response");

        let resp = self.http.put(url).json(body).send().await.map_err(|e| RelayError::Http {
            endpoint: endpoint.clone(),
            source: e,
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Api { endpoint, status, body });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> EncryptedPayload {
        EncryptedPayload {
            iv: "aXY=".into(),
            payload: "cGF5bG9hZA==".into(),
        }
    }

    #[test]
    fn url_keeps_relay_prefix() {
        let relay: Url = "https://relay.example/v1/".parse().unwrap();
        let url = RelayClient::url(&relay, "request", "abc-123").unwrap();
        assert_eq!(url.as_str(), "https://relay.example/v1/request/abc-123");

        let bare: Url = "https://relay.example".parse().unwrap();
        let url = RelayClient::url(&bare, "response", "a/b").unwrap();
        assert_eq!(url.as_str(), "https://relay.example/response/a%2Fb");
    }

    #[tokio::test]
    async fn get_request_returns_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/request/req-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(payload()))
            .expect(1)
            .mount(&server)
            .await;

        let relay: Url = server.uri().parse().unwrap();
        let body = RelayClient::new(reqwest::Client::new())
            .get_request(&relay, "req-1")
            .await
            .unwrap();
        assert_eq!(body, payload());
    }

    #[tokio::test]
    async fn get_request_non_2xx_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let relay: Url = server.uri().parse().unwrap();
        let err = RelayClient::new(reqwest::Client::new())
            .get_request(&relay, "gone")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Api { status: 404, .. }));
    }

    #[tokio::test]
    async fn put_response_sends_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/response/req-1"))
            .and(body_json(payload()))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let relay: Url = server.uri().parse().unwrap();
        RelayClient::new(reqwest::Client::new())
            .put_response(&relay, "req-1", &payload())
            .await
            .unwrap();
    }
}
