//! 章节解析：章节列表枚举与图片地址解析。
//!
//! 每个来源对应一个独立的解析策略：
//! - `mangatv`：章节页内嵌的混淆脚本，解包求值后得到图片列表（`packed`）；
//! - `ninemanga`：按页翻取 HTML 片段收集图片（`paginated`）。

pub mod listing;
pub mod packed;
pub mod paginated;
pub mod payload;
pub mod sandbox;
pub mod unpacker;

use std::time::Duration;

use clap::ValueEnum;
use scraper::Selector;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::base_system::context::Config;
use crate::base_system::cooldown_retry::{Attempt, Backoff, run_with_backoff};
use crate::download::models::ImageLocation;
use crate::network_parser::network::{Fetch, FetchError, FetchPolicy};

pub use packed::PackedScriptResolver;
pub use paginated::PaginatedResolver;

const PAGE_BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    #[value(name = "mangatv")]
    MangaTv,
    #[value(name = "ninemanga")]
    NineManga,
}

impl SourceKind {
    pub fn base_url(&self, language: &str) -> &'static str {
        match self {
            SourceKind::MangaTv => "https://www.mangatv.net/",
            SourceKind::NineManga if language.eq_ignore_ascii_case("en") => "https://ninemanga.com/",
            SourceKind::NineManga => "https://es.ninemanga.com/",
        }
    }

    /// 图片站点要求的默认 Referer；配置里显式填写时以配置为准。
    pub fn default_referer(&self, language: &str) -> Option<&'static str> {
        match self {
            SourceKind::MangaTv => None,
            SourceKind::NineManga => Some(self.base_url(language)),
        }
    }
}

/// 章节级的可恢复错误：跳过该章，不影响整批。
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("chapter page fetch failed: {0}")]
    FetchFailed(#[from] FetchError),
    #[error("no packed payload script found")]
    NoPayloadFound,
    #[error("payload evaluation failed: {0}")]
    EvalFailed(String),
    #[error("unrecognized payload schema: {0}")]
    UnrecognizedSchema(String),
    #[error("no images found")]
    NoImagesFound,
    #[error("no chapters found at {0}")]
    NoChaptersFound(String),
}

/// 按来源选择的图片地址解析策略。
#[derive(Debug, Clone)]
pub enum ImageLocationResolver {
    Packed(PackedScriptResolver),
    Paginated(PaginatedResolver),
}

impl ImageLocationResolver {
    pub fn for_source(config: &Config) -> Self {
        match config.source {
            SourceKind::MangaTv => Self::Packed(PackedScriptResolver::new(config)),
            SourceKind::NineManga => Self::Paginated(PaginatedResolver::new(config)),
        }
    }

    /// 返回按序号排列的图片位置；非法地址会被记录并剔除。
    pub fn resolve(
        &self,
        fetcher: &dyn Fetch,
        chapter_url: &str,
    ) -> Result<Vec<ImageLocation>, ResolutionError> {
        match self {
            Self::Packed(r) => r.resolve(fetcher, chapter_url),
            Self::Paginated(r) => r.resolve(fetcher, chapter_url),
        }
    }
}

/// 章节页请求：在 Fetcher 的传输层重试之外再套一层语义重试。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub policy: FetchPolicy,
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl PageRequest {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: config.page_policy(),
            max_attempts: config.page_max_attempts.max(1),
            backoff: Backoff::new(config.page_backoff(), PAGE_BACKOFF_CAP),
        }
    }

    pub fn fetch(&self, fetcher: &dyn Fetch, url: &str) -> Result<Vec<u8>, FetchError> {
        run_with_backoff(
            self.max_attempts,
            self.backoff,
            |_| {
                fetcher.fetch(url, &self.policy).map_err(|err| match err {
                    // 4xx 与非法地址重试也无用
                    FetchError::Status { status, .. } if (400..500).contains(&status) => {
                        Attempt::Abort(err)
                    }
                    FetchError::InvalidUrl { .. } => Attempt::Abort(err),
                    other => Attempt::Retry(other),
                })
            },
            |attempt, err, wait| {
                warn!(
                    "章节页第 {}/{} 次请求失败 {}: {}，{:?} 后重试",
                    attempt + 1,
                    self.max_attempts,
                    url,
                    err,
                    wait
                );
            },
        )
        .map_err(|exhausted| exhausted.last)
    }

    pub fn fetch_text(&self, fetcher: &dyn Fetch, url: &str) -> Result<String, FetchError> {
        let body = self.fetch(fetcher, url)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// 规范化为 http(s) 绝对地址；`base` 存在时先按其解析相对路径。
pub fn absolute_url(raw: &str, base: Option<&Url>) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let parsed = match base {
        Some(base) => base.join(raw).ok()?,
        None => Url::parse(raw).ok()?,
    };
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none_or(str::is_empty) {
        return None;
    }
    Some(parsed.to_string())
}

/// 按列表位置分配连续序号；非法地址剔除并记录日志。
pub fn assign_ordinals(urls: Vec<String>, base: Option<&Url>) -> Vec<ImageLocation> {
    let mut locations = Vec::with_capacity(urls.len());
    for (pos, raw) in urls.into_iter().enumerate() {
        match absolute_url(&raw, base) {
            Some(url) => locations.push(ImageLocation {
                ordinal: locations.len(),
                url,
            }),
            None => warn!("第 {} 个图片地址无效，已忽略: {:?}", pos + 1, raw),
        }
    }
    debug!("解析得到 {} 个图片地址", locations.len());
    locations
}

/// 编译期确定的 CSS 选择器。
pub(crate) fn css(selector: &'static str) -> Selector {
    Selector::parse(selector).expect("static css selector")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_parser::testing::StaticFetcher;

    fn quick_pages() -> PageRequest {
        PageRequest {
            policy: Config::default().page_policy(),
            max_attempts: 3,
            backoff: Backoff::new(Duration::ZERO, Duration::ZERO),
        }
    }

    #[test]
    fn absolute_url_accepts_only_http_schemes() {
        assert_eq!(
            absolute_url(" https://a.example/x.jpg ", None).as_deref(),
            Some("https://a.example/x.jpg")
        );
        assert_eq!(absolute_url("javascript:alert(1)", None), None);
        assert_eq!(absolute_url("/rel.jpg", None), None);
        assert_eq!(absolute_url("", None), None);

        let base = Url::parse("https://es.ninemanga.com/chapter/x/1-10-1.html").unwrap();
        assert_eq!(
            absolute_url("/img/1.jpg", Some(&base)).as_deref(),
            Some("https://es.ninemanga.com/img/1.jpg")
        );
    }

    #[test]
    fn ordinals_stay_contiguous_after_filtering() {
        let urls = vec![
            "https://a.example/1.jpg".to_string(),
            "not a url".to_string(),
            "https://a.example/3.jpg".to_string(),
        ];
        let locs = assign_ordinals(urls, None);
        assert_eq!(locs.len(), 2);
        assert_eq!(locs[0].ordinal, 0);
        assert_eq!(locs[1].ordinal, 1);
        assert_eq!(locs[1].url, "https://a.example/3.jpg");
    }

    #[test]
    fn page_request_does_not_retry_client_errors() {
        let fetcher = StaticFetcher::new().with_failure("https://a.example/gone", 404);
        let err = quick_pages().fetch(&fetcher, "https://a.example/gone").unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert_eq!(fetcher.hits("https://a.example/gone"), 1);
    }

    #[test]
    fn page_request_retries_server_errors() {
        let fetcher = StaticFetcher::new().with_failure("https://a.example/busy", 503);
        let _ = quick_pages().fetch(&fetcher, "https://a.example/busy");
        assert_eq!(fetcher.hits("https://a.example/busy"), 3);
    }

    #[test]
    fn source_kind_names_match_config_values() {
        let yaml = serde_yaml::to_string(&SourceKind::NineManga).unwrap();
        assert_eq!(yaml.trim(), "ninemanga");
        let parsed: SourceKind = serde_yaml::from_str("mangatv").unwrap();
        assert_eq!(parsed, SourceKind::MangaTv);
        assert_eq!(
            SourceKind::NineManga.default_referer("es"),
            Some("https://es.ninemanga.com/")
        );
        assert_eq!(SourceKind::MangaTv.default_referer("es"), None);
    }

    #[test]
    fn resolver_follows_configured_source() {
        let mut cfg = Config::default();
        assert!(matches!(
            ImageLocationResolver::for_source(&cfg),
            ImageLocationResolver::Packed(_)
        ));
        cfg.source = SourceKind::NineManga;
        assert!(matches!(
            ImageLocationResolver::for_source(&cfg),
            ImageLocationResolver::Paginated(_)
        ));
    }
}
