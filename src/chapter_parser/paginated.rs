//! ninemanga：逐页抓取 HTML 片段的解析策略。

use scraper::Html;
use tracing::{debug, info, warn};
use url::Url;

use super::{PageRequest, ResolutionError, assign_ordinals, css};
use crate::base_system::context::Config;
use crate::download::models::ImageLocation;
use crate::network_parser::network::Fetch;

const PAGE_SUFFIX: &str = ".html";
const PAGE_MARKER: &str = "-10-";

#[derive(Debug, Clone)]
pub struct PaginatedResolver {
    pages: PageRequest,
    max_pages: usize,
}

impl PaginatedResolver {
    pub fn new(config: &Config) -> Self {
        Self::with_parts(PageRequest::from_config(config), config.max_pages)
    }

    pub fn with_parts(pages: PageRequest, max_pages: usize) -> Self {
        Self {
            pages,
            max_pages: max_pages.max(1),
        }
    }

    pub fn resolve(
        &self,
        fetcher: &dyn Fetch,
        chapter_url: &str,
    ) -> Result<Vec<ImageLocation>, ResolutionError> {
        let base = Url::parse(chapter_url).ok();
        let mut urls: Vec<String> = Vec::new();
        let mut previous: Vec<String> = Vec::new();

        for page in 1..=self.max_pages {
            let url = page_url(chapter_url, page);
            let html = match self.pages.fetch_text(fetcher, &url) {
                Ok(html) => html,
                Err(e) => {
                    debug!("第 {} 页请求失败，视为没有更多页: {}", page, e);
                    break;
                }
            };

            let found = images_on_page(&html);
            if found.is_empty() {
                debug!("第 {} 页没有图片，停止翻页", page);
                break;
            }
            // 部分站点越界时重复返回最后一页
            if found == previous {
                debug!("第 {} 页与上一页相同，停止翻页", page);
                break;
            }
            urls.extend(found.iter().cloned());
            previous = found;

            if page == self.max_pages {
                warn!("{}: 已达到翻页上限 {}", chapter_url, self.max_pages);
            }
        }

        let locations = assign_ordinals(urls, base.as_ref());
        if locations.is_empty() {
            return Err(ResolutionError::NoImagesFound);
        }
        info!("{}: 解析到 {} 张图片", chapter_url, locations.len());
        Ok(locations)
    }
}

/// `…/chapter.html` → `…/chapter-10-{page}.html`。
pub fn page_url(chapter_url: &str, page: usize) -> String {
    let stem = chapter_url
        .rsplit_once(PAGE_SUFFIX)
        .map_or(chapter_url, |(head, _)| head);
    format!("{stem}{PAGE_MARKER}{page}{PAGE_SUFFIX}")
}

fn images_on_page(html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let selector = css("img.manga_pic");
    doc.select(&selector)
        .filter_map(|img| img.value().attr("src"))
        .map(str::trim)
        .filter(|src| !src.is_empty())
        .map(str::to_string)
        .collect()
}
