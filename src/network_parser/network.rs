use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONNECTION, HeaderMap, HeaderValue, REFERER, USER_AGENT};
use thiserror::Error;
use tracing::{debug, warn};

use crate::base_system::context::Config;
use crate::base_system::cooldown_retry::{Attempt, Backoff, run_with_backoff};

const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// 触发传输层重试的状态码。
const RETRY_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url: {url}")]
    InvalidUrl { url: String },
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("gave up on {url} after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last: String,
    },
}

/// 单次 GET 的超时与重试参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// 首次请求之外的额外重试次数
    pub max_retries: u32,
    pub backoff_base: Duration,
}

/// `fetch(url) -> bytes | FetchError`，解析与下载两侧共用。
pub trait Fetch: Send + Sync {
    fn fetch(&self, url: &str, policy: &FetchPolicy) -> Result<Vec<u8>, FetchError>;
}

pub fn is_retryable_status(status: u16) -> bool {
    RETRY_STATUSES.contains(&status)
}

/// 基于 reqwest blocking 的实现。
///
/// 连接超时只能在 Client 上设置：章节页的 Client 作为默认，图片连接超时
/// 不同时再单独建一个。构建后只读，可在下载线程间共享。
pub struct HttpFetcher {
    default: Client,
    default_connect_timeout: Duration,
    by_connect_timeout: Vec<(Duration, Client)>,
}

impl HttpFetcher {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let headers = default_headers(config);
        let build = |connect_timeout: Duration| {
            Client::builder()
                .default_headers(headers.clone())
                .connect_timeout(connect_timeout)
                .build()
        };

        let page = config.page_policy();
        let image = config.image_policy();
        let default = build(page.connect_timeout)?;
        let mut by_connect_timeout = Vec::new();
        if image.connect_timeout != page.connect_timeout {
            by_connect_timeout.push((image.connect_timeout, build(image.connect_timeout)?));
        }

        Ok(Self {
            default,
            default_connect_timeout: page.connect_timeout,
            by_connect_timeout,
        })
    }

    fn client_for(&self, connect_timeout: Duration) -> &Client {
        if connect_timeout == self.default_connect_timeout {
            return &self.default;
        }
        self.by_connect_timeout
            .iter()
            .find(|(t, _)| *t == connect_timeout)
            .map(|(_, c)| c)
            .unwrap_or(&self.default)
    }

    fn get_once(&self, url: &str, policy: &FetchPolicy) -> Result<Vec<u8>, Attempt<FetchError>> {
        let client = self.client_for(policy.connect_timeout);
        let resp = client
            .get(url)
            .timeout(policy.read_timeout)
            .send()
            .map_err(|source| classify_transport(url, source))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(classify_status(url, status));
        }

        resp.bytes()
            .map(|b| b.to_vec())
            .map_err(|source| classify_transport(url, source))
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: &str, policy: &FetchPolicy) -> Result<Vec<u8>, FetchError> {
        if url::Url::parse(url).is_err() {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
            });
        }

        let backoff = Backoff::new(policy.backoff_base, BACKOFF_CAP);
        run_with_backoff(
            policy.max_retries.saturating_add(1),
            backoff,
            |_| self.get_once(url, policy),
            |attempt, err, wait| {
                debug!("传输层重试 #{} {}: {}，{:?} 后重试", attempt + 1, url, err, wait);
            },
        )
        .map_err(|exhausted| match exhausted.last {
            // 不可重试的错误原样返回
            err @ (FetchError::Status { .. } | FetchError::InvalidUrl { .. })
                if exhausted.attempts == 1 =>
            {
                err
            }
            last => {
                warn!("请求失败 {}（{} 次尝试）: {}", url, exhausted.attempts, last);
                FetchError::RetriesExhausted {
                    url: url.to_string(),
                    attempts: exhausted.attempts,
                    last: last.to_string(),
                }
            }
        })
    }
}

fn classify_status(url: &str, status: StatusCode) -> Attempt<FetchError> {
    let err = FetchError::Status {
        url: url.to_string(),
        status: status.as_u16(),
    };
    if is_retryable_status(status.as_u16()) {
        Attempt::Retry(err)
    } else {
        Attempt::Abort(err)
    }
}

fn classify_transport(url: &str, source: reqwest::Error) -> Attempt<FetchError> {
    let retry = source.is_timeout() || source.is_connect() || source.is_request() || source.is_body();
    let err = FetchError::Transport {
        url: url.to_string(),
        source,
    };
    if retry {
        Attempt::Retry(err)
    } else {
        Attempt::Abort(err)
    }
}

fn default_headers(config: &Config) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8"),
    );
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&config.user_agent).unwrap_or(HeaderValue::from_static("Mozilla/5.0")),
    );
    if let Ok(v) = HeaderValue::from_str(&config.accept_language) {
        headers.insert(ACCEPT_LANGUAGE, v);
    }
    if let Some(referer) = config.referer()
        && let Ok(v) = HeaderValue::from_str(&referer)
    {
        headers.insert(REFERER, v);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_status_set() {
        for s in [408, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(s), "{s} should retry");
        }
        for s in [200, 301, 403, 404, 501] {
            assert!(!is_retryable_status(s), "{s} should not retry");
        }
    }

    #[test]
    fn status_classification_splits_retry_and_abort() {
        let url = "https://example.com/a.jpg";
        assert!(matches!(
            classify_status(url, StatusCode::SERVICE_UNAVAILABLE),
            Attempt::Retry(FetchError::Status { status: 503, .. })
        ));
        assert!(matches!(
            classify_status(url, StatusCode::NOT_FOUND),
            Attempt::Abort(FetchError::Status { status: 404, .. })
        ));
    }

    #[test]
    fn builds_one_client_per_connect_timeout() {
        let mut cfg = Config::default();
        let fetcher = HttpFetcher::new(&cfg).unwrap();
        assert!(fetcher.by_connect_timeout.is_empty());

        cfg.page_connect_timeout_secs = 20;
        let fetcher = HttpFetcher::new(&cfg).unwrap();
        assert_eq!(fetcher.by_connect_timeout.len(), 1);
        assert_eq!(fetcher.default_connect_timeout, Duration::from_secs(20));
    }

    #[test]
    fn rejects_relative_urls_without_network() {
        let fetcher = HttpFetcher::new(&Config::default()).unwrap();
        let err = fetcher
            .fetch("/relative/0001.jpg", &Config::default().image_policy())
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }
}
