//! 漫画主页的章节列表枚举。
//!
//! 站点按“最新在前”列出章节，这里统一翻转为阅读顺序。

use std::collections::HashSet;

use scraper::Html;
use tracing::{debug, info, warn};
use url::Url;

use super::{PageRequest, ResolutionError, SourceKind, absolute_url, css};
use crate::base_system::context::Config;
use crate::download::models::ChapterRef;
use crate::network_parser::network::Fetch;

/// ninemanga 的成人内容确认参数。
const NINEMANGA_CONFIRM: &str = "waring=1";

#[derive(Debug, Clone)]
pub struct ChapterLister {
    pages: PageRequest,
    source: SourceKind,
}

impl ChapterLister {
    pub fn new(config: &Config) -> Self {
        Self::with_parts(PageRequest::from_config(config), config.source)
    }

    pub fn with_parts(pages: PageRequest, source: SourceKind) -> Self {
        Self { pages, source }
    }

    pub fn list(
        &self,
        fetcher: &dyn Fetch,
        manga_url: &str,
    ) -> Result<Vec<ChapterRef>, ResolutionError> {
        let mut chapters = match self.source {
            SourceKind::MangaTv => {
                let html = self.pages.fetch_text(fetcher, manga_url)?;
                mangatv_chapters(&html, manga_url)
            }
            SourceKind::NineManga => self.ninemanga_list(fetcher, manga_url)?,
        };

        if chapters.is_empty() {
            return Err(ResolutionError::NoChaptersFound(manga_url.to_string()));
        }
        chapters.reverse();
        info!("{}: 共 {} 章", manga_url, chapters.len());
        Ok(chapters)
    }

    fn ninemanga_list(
        &self,
        fetcher: &dyn Fetch,
        manga_url: &str,
    ) -> Result<Vec<ChapterRef>, ResolutionError> {
        match self.pages.fetch_text(fetcher, manga_url) {
            Ok(html) => {
                let chapters = ninemanga_chapters(&html, manga_url);
                if !chapters.is_empty() {
                    return Ok(chapters);
                }
            }
            Err(e) => debug!("章节列表请求失败，尝试确认参数: {}", e),
        }

        let confirm_url = with_query(manga_url, NINEMANGA_CONFIRM);
        let html = self.pages.fetch_text(fetcher, &confirm_url)?;
        Ok(ninemanga_chapters(&html, manga_url))
    }
}

fn mangatv_chapters(html: &str, manga_url: &str) -> Vec<ChapterRef> {
    let base = Url::parse(manga_url).ok();
    let doc = Html::parse_document(html);
    let items = css("div#chapterlist li");
    let link = css("a.dload");
    let number = css("span.chapternum");

    let mut seen = HashSet::new();
    let mut chapters = Vec::new();
    for item in doc.select(&items) {
        let href = item.select(&link).next().and_then(|a| a.value().attr("href"));
        let name = item
            .select(&number)
            .next()
            .map(|s| s.text().collect::<String>().trim().to_string());
        let (Some(href), Some(name)) = (href, name) else {
            warn!("跳过缺少链接或章节号的条目");
            continue;
        };
        // 同名章节只保留第一个链接
        if !seen.insert(name.clone()) {
            continue;
        }
        push_chapter(&mut chapters, name, href, base.as_ref());
    }
    chapters
}

fn ninemanga_chapters(html: &str, manga_url: &str) -> Vec<ChapterRef> {
    let base = Url::parse(manga_url).ok();
    let doc = Html::parse_document(html);
    let items = css("div.chapterbox li");
    let link = css("a");

    let mut chapters = Vec::new();
    for item in doc.select(&items) {
        let Some(a) = item.select(&link).next() else {
            continue;
        };
        let (Some(href), Some(title)) = (a.value().attr("href"), a.value().attr("title")) else {
            continue;
        };
        let title = title.trim();
        if title.is_empty() {
            continue;
        }
        push_chapter(&mut chapters, title.to_string(), href, base.as_ref());
    }
    chapters
}

fn push_chapter(chapters: &mut Vec<ChapterRef>, name: String, href: &str, base: Option<&Url>) {
    match absolute_url(href, base) {
        Some(source_url) => chapters.push(ChapterRef {
            display_name: name,
            source_url,
        }),
        None => warn!("章节 {} 的链接无效: {:?}", name, href),
    }
}

fn with_query(url: &str, pair: &str) -> String {
    if url.contains('?') {
        format!("{url}&{pair}")
    } else {
        format!("{url}?{pair}")
    }
}

/// 未指定标题时，用主页地址最后一段路径推出一个可读名称。
pub fn title_from_url(manga_url: &str) -> Option<String> {
    let parsed = Url::parse(manga_url).ok()?;
    let segment = parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()?;
    let stem = segment.strip_suffix(".html").unwrap_or(segment);
    let title = stem.replace(['-', '_', '+'], " ");
    let title = title.trim();
    (!title.is_empty()).then(|| title.to_string())
}

/// 解析 `"N"` 或 `"A,B"`（1 起始、闭区间），返回 0 起始的下标区间。
pub fn parse_range(range: &str, total: usize) -> Result<std::ops::RangeInclusive<usize>, String> {
    let parse = |s: &str| {
        s.trim()
            .parse::<usize>()
            .map_err(|_| format!("无效的章节编号: {:?}", s.trim()))
    };
    let (start, end) = match range.split_once(',') {
        Some((a, b)) => (parse(a)?, parse(b)?),
        None => {
            let n = parse(range)?;
            (n, n)
        }
    };
    if start == 0 || end == 0 || start > end || end > total {
        return Err(format!("章节范围 {start}..{end} 超出 1..{total}"));
    }
    Ok(start - 1..=end - 1)
}
