//! 全局配置结构（Config）与默认值，以及归档文件命名工具。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigError, ConfigSpec, FieldMeta};
use crate::chapter_parser::SourceKind;
use crate::chapter_parser::payload::TokenTableRules;
use crate::network_parser::network::FetchPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 来源配置
    #[serde(default)]
    pub source: SourceKind,
    #[serde(default = "default_language")]
    pub language: String,

    // 保存配置
    #[serde(default)]
    pub save_path: String,
    #[serde(default = "default_false")]
    pub per_manga_folder: bool,
    #[serde(default = "default_image_extension")]
    pub image_extension: String,

    // 下载配置
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_image_max_attempts")]
    pub image_max_attempts: u32,
    #[serde(default = "default_image_backoff_base_ms")]
    pub image_backoff_base_ms: u64,
    #[serde(default = "default_image_connect_timeout_secs")]
    pub image_connect_timeout_secs: u64,
    #[serde(default = "default_image_read_timeout_secs")]
    pub image_read_timeout_secs: u64,

    // 章节页配置
    #[serde(default = "default_page_connect_timeout_secs")]
    pub page_connect_timeout_secs: u64,
    #[serde(default = "default_page_read_timeout_secs")]
    pub page_read_timeout_secs: u64,
    #[serde(default = "default_page_max_attempts")]
    pub page_max_attempts: u32,
    #[serde(default = "default_page_backoff_base_ms")]
    pub page_backoff_base_ms: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    // 传输层重试
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,
    #[serde(default = "default_transport_backoff_ms")]
    pub transport_backoff_ms: u64,

    // 脚本解包
    #[serde(default = "default_eval_timeout_secs")]
    pub eval_timeout_secs: u64,
    #[serde(default = "default_sink_name")]
    pub sink_name: String,
    #[serde(default)]
    pub token_table: TokenTableRules,

    // 请求头
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_accept_language")]
    pub accept_language: String,
    #[serde(default)]
    pub image_referer: String,

    // 批处理
    #[serde(default = "default_false")]
    pub halt_on_error: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            language: default_language(),
            save_path: String::new(),
            per_manga_folder: default_false(),
            image_extension: default_image_extension(),
            concurrency_limit: default_concurrency_limit(),
            image_max_attempts: default_image_max_attempts(),
            image_backoff_base_ms: default_image_backoff_base_ms(),
            image_connect_timeout_secs: default_image_connect_timeout_secs(),
            image_read_timeout_secs: default_image_read_timeout_secs(),
            page_connect_timeout_secs: default_page_connect_timeout_secs(),
            page_read_timeout_secs: default_page_read_timeout_secs(),
            page_max_attempts: default_page_max_attempts(),
            page_backoff_base_ms: default_page_backoff_base_ms(),
            max_pages: default_max_pages(),
            transport_retries: default_transport_retries(),
            transport_backoff_ms: default_transport_backoff_ms(),
            eval_timeout_secs: default_eval_timeout_secs(),
            sink_name: default_sink_name(),
            token_table: TokenTableRules::default(),
            user_agent: default_user_agent(),
            accept_language: default_accept_language(),
            image_referer: String::new(),
            halt_on_error: default_false(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 24] = [
            FieldMeta {
                name: "source",
                description: "漫画来源, 可选: [mangatv, ninemanga]",
            },
            FieldMeta {
                name: "language",
                description: "ninemanga 站点语言, 可选: [es, en]",
            },
            FieldMeta {
                name: "save_path",
                description: "CBZ 保存路径（留空为当前目录）",
            },
            FieldMeta {
                name: "per_manga_folder",
                description: "是否按漫画名建立子文件夹",
            },
            FieldMeta {
                name: "image_extension",
                description: "图片文件扩展名",
            },
            FieldMeta {
                name: "concurrency_limit",
                description: "单章图片并发下载数（慢速网络可调低）",
            },
            FieldMeta {
                name: "image_max_attempts",
                description: "单张图片最大尝试次数",
            },
            FieldMeta {
                name: "image_backoff_base_ms",
                description: "图片重试退避基数, 单位ms（每次翻倍）",
            },
            FieldMeta {
                name: "image_connect_timeout_secs",
                description: "图片连接超时（秒）",
            },
            FieldMeta {
                name: "image_read_timeout_secs",
                description: "图片读取超时（秒）",
            },
            FieldMeta {
                name: "page_connect_timeout_secs",
                description: "章节页连接超时（秒）",
            },
            FieldMeta {
                name: "page_read_timeout_secs",
                description: "章节页读取超时（秒）",
            },
            FieldMeta {
                name: "page_max_attempts",
                description: "章节页最大尝试次数",
            },
            FieldMeta {
                name: "page_backoff_base_ms",
                description: "章节页重试退避基数, 单位ms（每次翻倍）",
            },
            FieldMeta {
                name: "max_pages",
                description: "分页章节最多翻页数",
            },
            FieldMeta {
                name: "transport_retries",
                description: "传输层重试次数（408/429/5xx 与连接错误）",
            },
            FieldMeta {
                name: "transport_backoff_ms",
                description: "传输层重试退避基数, 单位ms",
            },
            FieldMeta {
                name: "eval_timeout_secs",
                description: "混淆脚本解包超时（秒）",
            },
            FieldMeta {
                name: "sink_name",
                description: "混淆脚本回传数据使用的对象名",
            },
            FieldMeta {
                name: "token_table",
                description: "token 表格式的改写规则（仅适用于 mangatv）",
            },
            FieldMeta {
                name: "user_agent",
                description: "请求使用的 User-Agent",
            },
            FieldMeta {
                name: "accept_language",
                description: "请求使用的 Accept-Language",
            },
            FieldMeta {
                name: "image_referer",
                description: "图片请求的 Referer（留空则不发送）",
            },
            FieldMeta {
                name: "halt_on_error",
                description: "任一章节失败时停止整批下载",
            },
        ];
        &FIELDS
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::Validation(
                "concurrency_limit 必须大于 0".to_string(),
            ));
        }
        if self.image_max_attempts == 0 || self.page_max_attempts == 0 {
            return Err(ConfigError::Validation(
                "image_max_attempts / page_max_attempts 必须大于 0".to_string(),
            ));
        }
        if self.image_extension.trim().trim_start_matches('.').is_empty() {
            return Err(ConfigError::Validation(
                "image_extension 不能为空".to_string(),
            ));
        }
        if self.sink_name.trim().is_empty() {
            return Err(ConfigError::Validation("sink_name 不能为空".to_string()));
        }
        self.token_table.validate()
    }
}

impl Config {
    pub fn default_save_dir(&self) -> PathBuf {
        if self.save_path.trim().is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            PathBuf::from(&self.save_path)
        }
    }

    /// 归档目标目录；开启 `per_manga_folder` 时追加漫画名子目录。
    pub fn archive_dir(&self, manga_title: &str) -> PathBuf {
        let root = self.default_save_dir();
        if self.per_manga_folder {
            root.join(sanitize_label(manga_title))
        } else {
            root
        }
    }

    pub fn image_ext(&self) -> &str {
        self.image_extension.trim().trim_start_matches('.')
    }

    /// 章节页请求策略：连接短、读取长、重试少。
    pub fn page_policy(&self) -> FetchPolicy {
        FetchPolicy {
            connect_timeout: Duration::from_secs(self.page_connect_timeout_secs.max(1)),
            read_timeout: Duration::from_secs(self.page_read_timeout_secs.max(1)),
            max_retries: self.transport_retries,
            backoff_base: Duration::from_millis(self.transport_backoff_ms),
        }
    }

    pub fn image_policy(&self) -> FetchPolicy {
        FetchPolicy {
            connect_timeout: Duration::from_secs(self.image_connect_timeout_secs.max(1)),
            read_timeout: Duration::from_secs(self.image_read_timeout_secs.max(1)),
            max_retries: self.transport_retries,
            backoff_base: Duration::from_millis(self.transport_backoff_ms),
        }
    }

    /// 配置留空时使用来源的默认 Referer。
    pub fn referer(&self) -> Option<String> {
        let configured = self.image_referer.trim();
        if !configured.is_empty() {
            return Some(configured.to_string());
        }
        self.source.default_referer(&self.language).map(str::to_string)
    }

    pub fn image_backoff(&self) -> Duration {
        Duration::from_millis(self.image_backoff_base_ms)
    }

    pub fn page_backoff(&self) -> Duration {
        Duration::from_millis(self.page_backoff_base_ms)
    }

    pub fn eval_timeout(&self) -> Duration {
        Duration::from_secs(self.eval_timeout_secs.max(1))
    }
}

/// 只保留字母数字、空格、`.` 与 `_`，去掉开头的点与末尾空白。
///
/// 结果会作为目录名和归档内路径，不能是 `.`、`..` 或隐藏文件名。
pub fn sanitize_label(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '_'))
        .collect();
    let trimmed = cleaned.trim_start_matches(['.', ' ']).trim_end();
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

const SHORT_NAME_LIMIT: usize = 50;
const SHORT_NAME_HEAD: usize = 30;
const SHORT_NAME_TAIL: usize = 20;

/// 超长文件名截成“前 30 + ... + 后 20”字符，保留开头与扩展名。
pub fn shorten_filename(filename: &str) -> String {
    let count = filename.chars().count();
    if count <= SHORT_NAME_LIMIT {
        return filename.to_string();
    }
    let head: String = filename.chars().take(SHORT_NAME_HEAD).collect();
    let tail: String = filename.chars().skip(count - SHORT_NAME_TAIL).collect();
    format!("{head}...{tail}")
}

/// `<漫画> - <章节>.cbz`，已清洗并按需截断。
pub fn archive_file_name(manga_title: &str, chapter_name: &str) -> String {
    shorten_filename(&format!(
        "{} - {}.cbz",
        sanitize_label(manga_title),
        sanitize_label(chapter_name)
    ))
}

fn default_false() -> bool {
    false
}

fn default_language() -> String {
    "es".to_string()
}

fn default_image_extension() -> String {
    "jpg".to_string()
}

fn default_concurrency_limit() -> usize {
    10
}

fn default_image_max_attempts() -> u32 {
    5
}

fn default_image_backoff_base_ms() -> u64 {
    2000
}

fn default_image_connect_timeout_secs() -> u64 {
    10
}

fn default_image_read_timeout_secs() -> u64 {
    30
}

fn default_page_connect_timeout_secs() -> u64 {
    10
}

fn default_page_read_timeout_secs() -> u64 {
    60
}

fn default_page_max_attempts() -> u32 {
    5
}

fn default_page_backoff_base_ms() -> u64 {
    2000
}

fn default_max_pages() -> usize {
    500
}

fn default_transport_retries() -> u32 {
    3
}

fn default_transport_backoff_ms() -> u64 {
    1000
}

fn default_eval_timeout_secs() -> u64 {
    20
}

fn default_sink_name() -> String {
    "ts_reader".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:97.0) Gecko/20100101 Firefox/97.0".to_string()
}

fn default_accept_language() -> String {
    "es-ES,es;q=0.9".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_punctuation_and_trailing_space() {
        assert_eq!(sanitize_label("Capítulo 12: ¿Fin? "), "Capítulo 12 Fin");
        assert_eq!(sanitize_label("vol_1.5 / extra"), "vol_1.5  extra");
        assert_eq!(sanitize_label("???"), "unnamed");
    }

    #[test]
    fn sanitize_never_yields_dot_segments() {
        assert_eq!(sanitize_label(".."), "unnamed");
        assert_eq!(sanitize_label("."), "unnamed");
        assert_eq!(sanitize_label(" . ."), "unnamed");
        assert_eq!(sanitize_label("../../etc"), "etc");
        assert_eq!(sanitize_label(".hidden"), "hidden");
        assert_eq!(sanitize_label("Vol. 2..."), "Vol. 2...");
    }

    #[test]
    fn dot_title_stays_inside_save_root() {
        let mut cfg = Config::default();
        cfg.save_path = "/data/cbz".to_string();
        cfg.per_manga_folder = true;
        assert_eq!(cfg.archive_dir(".."), PathBuf::from("/data/cbz/unnamed"));
    }

    #[test]
    fn shorten_keeps_head_and_tail() {
        let short = "One Piece - Capitulo 1.cbz";
        assert_eq!(shorten_filename(short), short);

        let long = format!("{} - Capitulo 1000.cbz", "A".repeat(60));
        let out = shorten_filename(&long);
        assert_eq!(out.chars().count(), 53);
        assert!(out.starts_with(&"A".repeat(30)));
        assert!(out.ends_with("- Capitulo 1000.cbz"));
    }

    #[test]
    fn shorten_counts_characters_not_bytes() {
        let long = "漫".repeat(60);
        let out = shorten_filename(&long);
        assert_eq!(out.chars().count(), 53);
    }

    #[test]
    fn archive_name_is_sanitized() {
        assert_eq!(
            archive_file_name("Berserk!", "Capítulo 3"),
            "Berserk - Capítulo 3.cbz"
        );
    }

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
        let mut cfg = Config::default();
        cfg.concurrency_limit = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn per_manga_folder_nests_archives() {
        let mut cfg = Config::default();
        cfg.save_path = "/data/cbz".to_string();
        assert_eq!(cfg.archive_dir("Dr. Stone"), PathBuf::from("/data/cbz"));
        cfg.per_manga_folder = true;
        assert_eq!(
            cfg.archive_dir("Dr. Stone"),
            PathBuf::from("/data/cbz/Dr. Stone")
        );
    }
}
