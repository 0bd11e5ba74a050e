use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use tracing::{debug, trace};

use super::{CacheKey, RemoteStore};
use crate::error::CacheError;

/// Remote tier speaking plain HTTP: `HEAD`, `GET` and `PUT` on
/// `<base>/<key>`, with optional basic authentication.
pub struct HttpRemoteStore {
    client: Client,
    base: String,
    user: Option<String>,
    pass: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(
        base: impl Into<String>,
        user: Option<String>,
        pass: Option<String>,
    ) -> Result<Self, CacheError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CacheError::Remote(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
            user,
            pass,
        })
    }

    fn url(&self, key: &CacheKey) -> String {
        format!("{}/{}", self.base, key)
    }

    fn auth(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.user {
            Some(user) => request.basic_auth(user, self.pass.as_ref()),
            None => request,
        }
    }

    fn send(&self, request: RequestBuilder, url: &str) -> Result<reqwest::blocking::Response, CacheError> {
        self.auth(request)
            .send()
            .map_err(|e| CacheError::Remote(format!("Request to {url} failed: {e}")))
    }
}

impl RemoteStore for HttpRemoteStore {
    fn contains(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let url = self.url(key);
        let response = self.send(self.client.head(&url), &url)?;
        trace!("HEAD {url} -> {}", response.status());

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(CacheError::Remote(format!("HTTP {status} from {url}"))),
        }
    }

    fn get(&self, key: &CacheKey) -> Result<Vec<u8>, CacheError> {
        let url = self.url(key);
        let response = self.send(self.client.get(&url), &url)?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(CacheError::Missing(key.to_string())),
            status => return Err(CacheError::Remote(format!("HTTP {status} from {url}"))),
        }

        let data = response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| CacheError::Remote(format!("Failed to read response: {e}")))?;

        debug!("fetched {} bytes from remote cache", data.len());
        Ok(data)
    }

    fn put(&self, key: &CacheKey, data: &[u8]) -> Result<(), CacheError> {
        let url = self.url(key);
        let response = self.send(self.client.put(&url).body(data.to_vec()), &url)?;

        if !response.status().is_success() {
            return Err(CacheError::Remote(format!(
                "HTTP {} from PUT {}",
                response.status(),
                url
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_strips_trailing_slash() {
        let store = HttpRemoteStore::new("https://cache.example.com/kiln/", None, None).unwrap();
        let key = CacheKey("0123".into());
        assert_eq!(store.url(&key), "https://cache.example.com/kiln/0123");
    }

    #[test]
    fn test_unreachable_host_is_remote_error() {
        let store = HttpRemoteStore::new("http://127.0.0.1:9", Some("u".into()), None).unwrap();
        let key = CacheKey("abcd".into());
        assert!(matches!(store.contains(&key), Err(CacheError::Remote(_))));
    }
}
