//! 无交互命令行流程：列章节、按范围批量下载、打印汇总。

use std::path::Path;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::base_system::context::{Config, archive_file_name};
use crate::chapter_parser::listing::{ChapterLister, parse_range, title_from_url};
use crate::download::models::{BatchSummary, ChapterOutcome, ChapterRef};
use crate::download::{BatchPolicy, ChapterOrchestrator, run_batch};
use crate::network_parser::network::HttpFetcher;

/// 命令行给出的下载目标。
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub title: Option<String>,
    pub manga_url: Option<String>,
    pub range: Option<String>,
    pub list_only: bool,
    pub chapter_url: Option<String>,
    pub chapter_name: Option<String>,
}

/// 列表模式返回 `None`；下载模式返回批处理汇总。
pub fn run(config: &Config, request: &RunRequest, cancel: &AtomicBool) -> Result<Option<BatchSummary>> {
    let fetcher = HttpFetcher::new(config).context("初始化 HTTP 客户端失败")?;

    let chapters = match (&request.chapter_url, &request.manga_url) {
        (Some(url), _) => vec![single_chapter(url, request.chapter_name.as_deref())],
        (None, Some(manga_url)) => {
            let all = ChapterLister::new(config)
                .list(&fetcher, manga_url)
                .with_context(|| format!("获取章节列表失败: {manga_url}"))?;
            if request.list_only {
                print_chapters(&all);
                return Ok(None);
            }
            select_range(all, request.range.as_deref())?
        }
        (None, None) => return Err(anyhow!("需要 --manga-url 或 --chapter-url")),
    };

    let title = manga_title(request);
    let save_dir = config.archive_dir(&title);
    std::fs::create_dir_all(&save_dir)
        .with_context(|| format!("创建目录失败: {}", save_dir.display()))?;
    info!("保存到 {}，共 {} 章", save_dir.display(), chapters.len());

    let orchestrator = ChapterOrchestrator::new(&fetcher, config);
    let summary = run_batch(
        &orchestrator,
        &chapters,
        |chapter| save_dir.join(archive_file_name(&title, &chapter.display_name)),
        BatchPolicy::from_flag(config.halt_on_error),
        cancel,
    );

    print_summary(&summary, &save_dir);
    Ok(Some(summary))
}

fn single_chapter(url: &str, name: Option<&str>) -> ChapterRef {
    let display_name = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .or_else(|| title_from_url(url))
        .unwrap_or_else(|| "chapter".to_string());
    ChapterRef {
        display_name,
        source_url: url.to_string(),
    }
}

fn manga_title(request: &RunRequest) -> String {
    request
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .or_else(|| request.manga_url.as_deref().and_then(title_from_url))
        .unwrap_or_else(|| "manga".to_string())
}

fn select_range(chapters: Vec<ChapterRef>, range: Option<&str>) -> Result<Vec<ChapterRef>> {
    let Some(range) = range else {
        return Ok(chapters);
    };
    let indices = parse_range(range, chapters.len()).map_err(|e| anyhow!(e))?;
    Ok(chapters
        .into_iter()
        .enumerate()
        .filter(|(i, _)| indices.contains(i))
        .map(|(_, c)| c)
        .collect())
}

fn print_chapters(chapters: &[ChapterRef]) {
    println!("\n===== 章节列表 =====");
    for (idx, chapter) in chapters.iter().enumerate() {
        println!("{:>4}. {}", idx + 1, chapter.display_name);
    }
    println!("共 {} 章，使用 --range N 或 --range A,B 选择\n", chapters.len());
}

fn print_summary(summary: &BatchSummary, save_dir: &Path) {
    println!("\n===== 下载结果 =====");
    for (chapter, outcome) in &summary.outcomes {
        match outcome {
            ChapterOutcome::Success { manifest, partial } => {
                let name = manifest
                    .archive_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                match partial {
                    Some((ok, total)) => println!(
                        "[部分] {} -> {}（{}/{} 张）",
                        chapter.display_name, name, ok, total
                    ),
                    None => println!(
                        "[完成] {} -> {}（{} 张）",
                        chapter.display_name, name, manifest.entry_count
                    ),
                }
            }
            ChapterOutcome::Failure { stage, reason } => {
                println!("[失败] {}（{}）: {}", chapter.display_name, stage, reason);
            }
        }
    }
    if summary.cancelled {
        println!("已中断，{} 章未处理", summary.skipped);
    } else if summary.skipped > 0 {
        println!("因失败停止，{} 章未处理", summary.skipped);
    }
    println!(
        "成功 {}，失败 {}，保存目录 {}\n",
        summary.succeeded(),
        summary.failed(),
        save_dir.display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(n: usize) -> Vec<ChapterRef> {
        (1..=n)
            .map(|i| ChapterRef {
                display_name: format!("Capitulo {i}"),
                source_url: format!("https://x.example/c/{i}"),
            })
            .collect()
    }

    #[test]
    fn range_selects_inclusive_slice() {
        let picked = select_range(refs(10), Some("3,5")).unwrap();
        let names: Vec<&str> = picked.iter().map(|c| c.display_name.as_str()).collect();
        assert_eq!(names, vec!["Capitulo 3", "Capitulo 4", "Capitulo 5"]);
        assert_eq!(select_range(refs(4), None).unwrap().len(), 4);
        assert!(select_range(refs(4), Some("9")).is_err());
    }

    #[test]
    fn title_prefers_explicit_value() {
        let mut req = RunRequest {
            manga_url: Some("https://www.mangatv.net/manga/dr-stone".to_string()),
            ..RunRequest::default()
        };
        assert_eq!(manga_title(&req), "dr stone");
        req.title = Some(" Dr. Stone ".to_string());
        assert_eq!(manga_title(&req), "Dr. Stone");
        assert_eq!(manga_title(&RunRequest::default()), "manga");
    }

    #[test]
    fn single_chapter_name_falls_back_to_url() {
        let c = single_chapter("https://es.ninemanga.com/chapter/Berserk/99.html", None);
        assert_eq!(c.display_name, "99");
        let c = single_chapter("https://x.example/c/1", Some("Prologo"));
        assert_eq!(c.display_name, "Prologo");
    }
}
