//! Origin access
//!
//! The [Fetcher] trait is the seam between the cache and the origin. The
//! production implementation is [OriginFetcher], an HTTP GET of
//! `mirror + key` whose response is captured as a [CachedResponse] blob.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, FetchError};

pub const DEFAULT_ORIGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Loads the bytes stored under a key
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Bytes, FetchError>;
}

/// Origin response as stored in the cache: every header value, in the
/// order the origin sent them, and the body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub header: BTreeMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn encode(&self) -> Result<Bytes, FetchError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(blob: &[u8]) -> Result<CachedResponse, FetchError> {
        Ok(bincode::deserialize(blob)?)
    }
}

/// Mirror base URL, shared between the configuration and the membership
/// protocol. Peers learn it from the master's login reply
#[derive(Debug, Clone, Default)]
pub struct MirrorHandle {
    inner: Arc<RwLock<Option<Url>>>,
}

impl MirrorHandle {
    pub fn new(mirror: Option<Url>) -> MirrorHandle {
        MirrorHandle {
            inner: Arc::new(RwLock::new(mirror)),
        }
    }

    pub fn parse(mirror: &str) -> Result<Url, ConfigError> {
        let url = Url::parse(mirror).map_err(|_| ConfigError::InvalidMirror(mirror.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidMirror(mirror.to_string()));
        }
        Ok(url)
    }

    pub fn set(&self, mirror: &str) -> Result<(), ConfigError> {
        let url = MirrorHandle::parse(mirror)?;
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(url);
        Ok(())
    }

    pub fn get(&self) -> Option<Url> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Checks `key` is an absolute path without parent segments
pub fn validate_key(key: &str) -> Result<(), FetchError> {
    if !key.starts_with('/') || key.split('/').any(|segment| segment == "..") {
        return Err(FetchError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// HTTP [Fetcher] over the mirror
#[derive(Debug, Clone)]
pub struct OriginFetcher {
    client: reqwest::Client,
    mirror: MirrorHandle,
}

impl OriginFetcher {
    pub fn new(mirror: MirrorHandle, timeout: Duration) -> Result<OriginFetcher, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| FetchError::OriginUnreachable(err.to_string()))?;
        Ok(OriginFetcher { client, mirror })
    }

    pub fn mirror(&self) -> &MirrorHandle {
        &self.mirror
    }

    /// `mirror + key`, the mirror's trailing slash removed
    pub fn url_for(&self, key: &str) -> Result<Url, FetchError> {
        validate_key(key)?;
        let mirror = self
            .mirror
            .get()
            .ok_or_else(|| FetchError::OriginUnreachable("no mirror configured".to_string()))?;
        let url = format!("{}{}", mirror.as_str().trim_end_matches('/'), key);
        Url::parse(&url).map_err(|_| FetchError::InvalidKey(key.to_string()))
    }
}

#[async_trait]
impl Fetcher for OriginFetcher {
    async fn fetch(&self, key: &str) -> Result<Bytes, FetchError> {
        let url = self.url_for(key)?;
        debug!(url:% = url; "Fetching from origin");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::OriginUnreachable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::OriginError(status.as_u16()));
        }

        let mut header: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in response.headers() {
            header
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| FetchError::OriginUnreachable(err.to_string()))?;

        CachedResponse {
            header,
            body: body.to_vec(),
        }
        .encode()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::http::{header, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn fetcher(mirror: &str) -> OriginFetcher {
        let mirror = MirrorHandle::new(Some(MirrorHandle::parse(mirror).unwrap()));
        OriginFetcher::new(mirror, Duration::from_secs(5)).unwrap()
    }

    async fn origin() -> Result<String, Box<dyn std::error::Error>> {
        let app = Router::new()
            .route(
                "/static/logo.png",
                get(|| async {
                    (
                        [
                            (header::CONTENT_TYPE, "image/png"),
                            (header::CACHE_CONTROL, "max-age=60"),
                        ],
                        vec![7u8; 1024],
                    )
                        .into_response()
                }),
            )
            .route(
                "/static/broken",
                get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move { axum::serve(listener, app).await });
        Ok(format!("http://{}/static/", addr))
    }

    #[test]
    fn keys_must_be_absolute_paths() {
        assert!(validate_key("/logo.png").is_ok());
        assert!(validate_key("/a/b/c.js").is_ok());
        assert_eq!(
            validate_key("logo.png"),
            Err(FetchError::InvalidKey("logo.png".to_string()))
        );
        assert!(validate_key("/a/../etc/passwd").is_err());
    }

    #[test]
    fn url_is_mirror_plus_key() -> TestResult {
        let with_slash = fetcher("http://origin.example/static/");
        assert_eq!(
            with_slash.url_for("/logo.png")?.as_str(),
            "http://origin.example/static/logo.png"
        );
        let without_slash = fetcher("http://origin.example");
        assert_eq!(
            without_slash.url_for("/logo.png")?.as_str(),
            "http://origin.example/logo.png"
        );
        Ok(())
    }

    #[test]
    fn mirror_must_be_http() {
        assert!(MirrorHandle::parse("ftp://origin.example/").is_err());
        assert!(MirrorHandle::parse("not a url").is_err());
        let handle = MirrorHandle::default();
        assert!(handle.get().is_none());
        handle.set("https://origin.example/").unwrap();
        assert_eq!(handle.get().unwrap().host_str(), Some("origin.example"));
    }

    #[test]
    fn cached_response_blob() -> TestResult {
        let mut response = CachedResponse::default();
        response.header.insert(
            "set-cookie".to_string(),
            vec!["a=1".to_string(), "b=2".to_string()],
        );
        response.body = b"body".to_vec();
        let blob = response.encode()?;
        assert_eq!(CachedResponse::decode(&blob)?, response);
        assert!(matches!(
            CachedResponse::decode(b"\xff"),
            Err(FetchError::Encoding(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn fetch_captures_headers_and_body() -> TestResult {
        let origin_fetcher = fetcher(&origin().await?);
        let blob = origin_fetcher.fetch("/logo.png").await?;
        let response = CachedResponse::decode(&blob)?;
        assert_eq!(response.body, vec![7u8; 1024]);
        assert_eq!(
            response.header.get("content-type"),
            Some(&vec!["image/png".to_string()])
        );
        assert_eq!(
            response.header.get("cache-control"),
            Some(&vec!["max-age=60".to_string()])
        );
        Ok(())
    }

    #[tokio::test]
    async fn fetch_errors() -> TestResult {
        let origin_fetcher = fetcher(&origin().await?);
        assert_eq!(
            origin_fetcher.fetch("/broken").await,
            Err(FetchError::OriginError(500))
        );
        assert_eq!(
            origin_fetcher.fetch("/missing").await,
            Err(FetchError::OriginError(404))
        );

        let unconfigured =
            OriginFetcher::new(MirrorHandle::default(), Duration::from_secs(1))?;
        assert!(matches!(
            unconfigured.fetch("/logo.png").await,
            Err(FetchError::OriginUnreachable(_))
        ));

        // nothing listens on a port we just released
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);
        let unreachable = fetcher(&format!("http://{}/", addr));
        assert!(matches!(
            unreachable.fetch("/logo.png").await,
            Err(FetchError::OriginUnreachable(_))
        ));
        Ok(())
    }
}
