use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method, RequestBuilder};
use tracing::debug;

use crate::cache::CacheManager;
use crate::config::DownloadConfig;
use crate::cookies;
use crate::error::DownloadError;

/// HTTP facade shared by every engine: one configured client, default
/// headers, and the response cache. Responses are always surfaced raw; no
/// body is parsed implicitly.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    cache: Arc<CacheManager>,
}

impl HttpClient {
    pub fn new(config: &DownloadConfig) -> Result<Self, DownloadError> {
        let client = create_client(config)?;
        let disk_root = if config.no_cache {
            None
        } else {
            Some(std::env::temp_dir().join("sluice-cache"))
        };
        Ok(Self {
            client,
            cache: Arc::new(CacheManager::new(disk_root)),
        })
    }

    /// Build a request with the per-stream headers merged over the client
    /// defaults (per-stream wins).
    pub fn request(&self, method: Method, url: &str, headers: &HeaderMap) -> RequestBuilder {
        let mut builder = self.client.request(method, url);
        if !headers.is_empty() {
            builder = builder.headers(headers.clone());
        }
        builder
    }

    pub fn get(&self, url: &str, headers: &HeaderMap) -> RequestBuilder {
        self.request(Method::GET, url, headers)
    }

    pub fn head(&self, url: &str, headers: &HeaderMap) -> RequestBuilder {
        self.request(Method::HEAD, url, headers)
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }
}

/// Create a reqwest client from the download configuration: timeouts, proxy,
/// cookie jar, user agent, and the default header set.
pub fn create_client(config: &DownloadConfig) -> Result<Client, DownloadError> {
    let mut headers = default_headers();
    for (name, value) in &config.headers {
        headers.insert(name.clone(), value.clone());
    }

    let mut builder = Client::builder()
        .user_agent(&config.user_agent)
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(10))
        .pool_max_idle_per_host(10);

    if !config.timeout.is_zero() {
        builder = builder.timeout(config.timeout);
    }

    if let Some(proxy) = &config.proxy {
        let proxy = reqwest::Proxy::all(proxy).map_err(|e| DownloadError::Configuration {
            reason: format!("invalid proxy URL `{proxy}`: {e}"),
        })?;
        builder = builder.proxy(proxy);
        debug!("using configured proxy for downloads");
    }

    if let Some(cookie_file) = &config.cookie_file {
        let jar = cookies::jar_from_file(cookie_file)?;
        builder = builder.cookie_provider(jar);
    }

    builder.build().map_err(DownloadError::from)
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(
        reqwest::header::ACCEPT_ENCODING,
        HeaderValue::from_static("gzip, deflate"),
    );
    headers.insert(
        reqwest::header::CONNECTION,
        HeaderValue::from_static("keep-alive"),
    );
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_defaults() {
        let config = DownloadConfig::default();
        assert!(HttpClient::new(&config).is_ok());
    }

    #[test]
    fn rejects_malformed_proxy() {
        let config = DownloadConfig {
            proxy: Some("::not a url::".to_owned()),
            ..Default::default()
        };
        let err = create_client(&config).unwrap_err();
        assert!(matches!(err, DownloadError::Configuration { .. }));
    }
}
