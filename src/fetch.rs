//! Source fetching with an origin allowlist.
//!
//! Security model:
//! - Only URLs matching allowed origins can be fetched
//! - Redirects only followed if they stay within the same origin
//! - Any non-success status is a hard failure

use async_trait::async_trait;
use reqwest::Client;
use std::collections::BTreeMap;
use url::Url;

const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("fetch blocked: {0}")]
    Blocked(String),

    #[error("server answered {status} {reason}")]
    Status { status: u16, reason: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Plain GET of text content. Implementations must not retry on their own;
/// retry policy belongs to the load orchestrator.
#[async_trait(?Send)]
pub trait SourceFetcher {
    async fn fetch_text(
        &self,
        url: &Url,
        headers: &BTreeMap<String, String>,
    ) -> Result<String, FetchError>;
}

/// Configuration for fetch allowlist
#[derive(Debug, Clone, Default)]
pub struct FetchConfig {
    /// Allowed origins (e.g., "https://git.example.org")
    /// An origin is scheme + host + port
    pub allowed_origins: Vec<String>,
}

impl FetchConfig {
    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        if self.allowed_origins.is_empty() {
            return false;
        }
        let origin = url.origin().ascii_serialization();
        self.allowed_origins.iter().any(|allowed| origin == *allowed)
    }
}

/// reqwest-backed fetcher used against real hosts.
pub struct HttpFetcher {
    client: Client,
    config: FetchConfig,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            // Don't follow redirects automatically - we'll handle them manually
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| FetchError::Transport(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }
}

#[async_trait(?Send)]
impl SourceFetcher for HttpFetcher {
    async fn fetch_text(
        &self,
        url: &Url,
        headers: &BTreeMap<String, String>,
    ) -> Result<String, FetchError> {
        if !self.config.is_origin_allowed(url) {
            return Err(FetchError::Blocked(format!(
                "origin '{}' is not in the allowlist. Allowed: {:?}",
                url.origin().ascii_serialization(),
                self.config.allowed_origins
            )));
        }

        let mut current = url.clone();
        for _ in 0..=MAX_REDIRECTS {
            let mut req_builder = self.client.get(current.clone());
            for (key, value) in headers {
                req_builder = req_builder.header(key, value);
            }

            let response = req_builder
                .send()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))?;

            let status = response.status();

            if status.is_redirection() {
                let Some(location) = response.headers().get("location") else {
                    return Err(FetchError::Status {
                        status: status.as_u16(),
                        reason: "redirect without location".into(),
                    });
                };
                let location_str = location
                    .to_str()
                    .map_err(|_| FetchError::Transport("invalid redirect location".into()))?;
                let redirect_url = current
                    .join(location_str)
                    .map_err(|e| FetchError::Transport(format!("invalid redirect URL: {}", e)))?;

                // Check if redirect is to same origin
                if redirect_url.origin() != url.origin() {
                    return Err(FetchError::Blocked(format!(
                        "redirect to different origin '{}' (original: '{}')",
                        redirect_url.origin().ascii_serialization(),
                        url.origin().ascii_serialization()
                    )));
                }

                current = redirect_url;
                continue;
            }

            if !status.is_success() {
                return Err(FetchError::Status {
                    status: status.as_u16(),
                    reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
                });
            }

            return response
                .text()
                .await
                .map_err(|e| FetchError::Transport(format!("failed to read response body: {}", e)));
        }

        Err(FetchError::Transport(format!(
            "too many redirects (max {})",
            MAX_REDIRECTS
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher_for(server: &MockServer) -> HttpFetcher {
        HttpFetcher::new(FetchConfig {
            allowed_origins: vec![server.uri()],
        })
        .unwrap()
    }

    #[test]
    fn test_origin_matching() {
        let config = FetchConfig {
            allowed_origins: vec![
                "https://git.example.org".to_string(),
                "http://localhost:3000".to_string(),
            ],
        };

        // Allowed
        assert!(config.is_origin_allowed(&Url::parse("https://git.example.org/hooks/get.jsx").unwrap()));
        assert!(config.is_origin_allowed(&Url::parse("http://localhost:3000/hooks").unwrap()));

        // Not allowed
        assert!(!config.is_origin_allowed(&Url::parse("https://evil.com/hooks").unwrap()));
        assert!(!config.is_origin_allowed(&Url::parse("http://git.example.org/hooks").unwrap())); // http vs https
        assert!(!config.is_origin_allowed(&Url::parse("https://git.example.org:8080/").unwrap())); // different port
    }

    #[test]
    fn test_empty_allowlist() {
        let config = FetchConfig {
            allowed_origins: vec![],
        };

        assert!(!config.is_origin_allowed(&Url::parse("https://anything.com").unwrap()));
    }

    #[tokio::test]
    async fn test_fetches_body_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hooks/get.jsx"))
            .and(header("X-Repo-Branch", "main"))
            .respond_with(ResponseTemplate::new(200).set_body_string("export default 1"))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/hooks/get.jsx", server.uri())).unwrap();
        let headers = BTreeMap::from([("X-Repo-Branch".to_string(), "main".to_string())]);
        let body = fetcher_for(&server).fetch_text(&url, &headers).await.unwrap();
        assert_eq!(body, "export default 1");
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/hooks/missing.jsx", server.uri())).unwrap();
        let err = fetcher_for(&server)
            .fetch_text(&url, &BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_follows_same_origin_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hooks/old.jsx"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/hooks/new.jsx"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/hooks/new.jsx"))
            .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/hooks/old.jsx", server.uri())).unwrap();
        let body = fetcher_for(&server)
            .fetch_text(&url, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(body, "moved");
    }

    #[tokio::test]
    async fn test_blocks_cross_origin_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "https://evil.com/payload.js"),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/hooks/get.jsx", server.uri())).unwrap();
        let err = fetcher_for(&server)
            .fetch_text(&url, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Blocked(_)));
    }

    #[tokio::test]
    async fn test_blocks_origin_outside_allowlist() {
        let fetcher = HttpFetcher::new(FetchConfig {
            allowed_origins: vec!["https://git.example.org".into()],
        })
        .unwrap();
        let url = Url::parse("https://evil.com/hooks/get.jsx").unwrap();
        let err = fetcher.fetch_text(&url, &BTreeMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("not in the allowlist"));
    }
}
