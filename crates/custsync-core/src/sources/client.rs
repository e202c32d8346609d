use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{FetchError, FetchResult};

const USER_AGENT: &str = concat!("custsync/", env!("CARGO_PKG_VERSION"));

/// Longest response body kept in a [`FetchError::Status`].
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub connect_timeout_seconds: u32,
    pub request_timeout_seconds: u32,
    pub user_agent: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: 10,
            request_timeout_seconds: 30,
            user_agent: None,
        }
    }
}

/// HTTP client shared by the source fetchers and the remote index
/// providers. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SourceClient {
    config: ClientConfig,
    inner: Client,
}

impl SourceClient {
    pub fn new(config: ClientConfig) -> FetchResult<Self> {
        let inner = Client::builder()
            .connect_timeout(Duration::from_secs(u64::from(config.connect_timeout_seconds)))
            .timeout(Duration::from_secs(u64::from(config.request_timeout_seconds)))
            .user_agent(config.user_agent.as_deref().unwrap_or(USER_AGENT))
            .build()?;

        Ok(Self { config, inner })
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Parses a configured base URL. Only http(s) URLs with a host are
    /// accepted; a trailing slash is dropped so paths can be appended.
    pub fn base_url(raw: &str) -> FetchResult<Url> {
        let url = Url::parse(raw.trim_end_matches('/'))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(FetchError::InvalidUrl("No host in URL".to_string()));
        }
        Ok(url)
    }

    /// `base` joined with `path`, keeping any path prefix already on `base`.
    pub fn endpoint(base: &Url, path: &str) -> FetchResult<Url> {
        let joined = format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Ok(Url::parse(&joined)?)
    }

    #[must_use]
    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.inner.request(method, url)
    }

    /// Sends the request and decodes a JSON body, turning non-success
    /// statuses into [`FetchError::Status`].
    pub async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> FetchResult<T> {
        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > ERROR_BODY_LIMIT {
                let mut end = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_accepts_http_with_prefix() {
        let url = SourceClient::base_url("http://localhost:3001/mock-apis/salesforce/").unwrap();
        let endpoint =
            SourceClient::endpoint(&url, "/services/data/v58.0/sobjects/Opportunity").unwrap();
        assert_eq!(
            endpoint.as_str(),
            "http://localhost:3001/mock-apis/salesforce/services/data/v58.0/sobjects/Opportunity"
        );
    }

    #[test]
    fn test_base_url_rejects_invalid() {
        assert!(matches!(
            SourceClient::base_url("not-a-url"),
            Err(FetchError::UrlParse(_))
        ));
        assert!(matches!(
            SourceClient::base_url("file:///etc/passwd"),
            Err(FetchError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_client_config_access() {
        let config = ClientConfig {
            request_timeout_seconds: 5,
            ..Default::default()
        };
        let client = SourceClient::new(config).unwrap();
        assert_eq!(client.config().request_timeout_seconds, 5);
        assert_eq!(client.config().connect_timeout_seconds, 10);
    }
}
