//! mangatv：章节页内嵌混淆脚本的解析策略。

use scraper::Html;
use tracing::{debug, info};

use super::payload::{TokenTableRules, extract_image_urls};
use super::sandbox::Sandbox;
use super::unpacker::contains_packer;
use super::{PageRequest, ResolutionError, assign_ordinals, css};
use crate::base_system::context::Config;
use crate::download::models::ImageLocation;
use crate::network_parser::network::Fetch;

#[derive(Debug, Clone)]
pub struct PackedScriptResolver {
    pages: PageRequest,
    sandbox: Sandbox,
    rules: TokenTableRules,
}

impl PackedScriptResolver {
    pub fn new(config: &Config) -> Self {
        Self {
            pages: PageRequest::from_config(config),
            sandbox: Sandbox::new(config.sink_name.clone(), config.eval_timeout()),
            rules: config.token_table.clone(),
        }
    }

    pub fn with_parts(pages: PageRequest, sandbox: Sandbox, rules: TokenTableRules) -> Self {
        Self {
            pages,
            sandbox,
            rules,
        }
    }

    pub fn resolve(
        &self,
        fetcher: &dyn Fetch,
        chapter_url: &str,
    ) -> Result<Vec<ImageLocation>, ResolutionError> {
        let html = self.pages.fetch_text(fetcher, chapter_url)?;
        let script = find_packed_script(&html).ok_or(ResolutionError::NoPayloadFound)?;
        debug!("找到混淆脚本，长度 {} 字节", script.len());

        let captured = self
            .sandbox
            .evaluate(&script)
            .map_err(|e| ResolutionError::EvalFailed(e.to_string()))?;

        let urls = extract_image_urls(&captured, &self.rules)?;
        let locations = assign_ordinals(urls, None);
        if locations.is_empty() {
            return Err(ResolutionError::NoImagesFound);
        }
        info!("{}: 解析到 {} 张图片", chapter_url, locations.len());
        Ok(locations)
    }
}

/// 返回第一个带打包器特征的 `<script>` 内容。
fn find_packed_script(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let scripts = css("script");
    doc.select(&scripts)
        .map(|node| node.text().collect::<String>())
        .find(|text| contains_packer(text))
}
