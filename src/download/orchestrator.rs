//! 单章流程编排：解析 → 下载 → 打包。
//!
//! 暂存目录在进入下载阶段时创建，离开状态机时无论成败都会删除。
//! 本模块只给出单章结果，是否继续下一章由批处理层决定。

use std::error::Error;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use super::image_pool::ConcurrentDownloader;
use super::models::{ChapterOutcome, ChapterRef, ChapterState, Stage};
use super::progress::ChapterProgress;
use crate::base_system::context::Config;
use crate::chapter_parser::{ImageLocationResolver, ResolutionError};
use crate::network_parser::network::Fetch;
use crate::packaging::Archiver;

const SCRATCH_PREFIX: &str = "manga-cbz-";

pub struct ChapterOrchestrator<'a> {
    fetcher: &'a dyn Fetch,
    resolver: ImageLocationResolver,
    downloader: ConcurrentDownloader<'a>,
    archiver: Archiver,
    concurrency_limit: usize,
    scratch_root: Option<PathBuf>,
    show_progress: bool,
}

impl<'a> ChapterOrchestrator<'a> {
    pub fn new(fetcher: &'a dyn Fetch, config: &Config) -> Self {
        Self {
            fetcher,
            resolver: ImageLocationResolver::for_source(config),
            downloader: ConcurrentDownloader::new(fetcher, config),
            archiver: Archiver::new(config.image_ext()),
            concurrency_limit: config.concurrency_limit.max(1),
            scratch_root: None,
            show_progress: true,
        }
    }

    /// 暂存目录的父目录，默认是系统临时目录。
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// 处理一章，归档写到 `destination`。
    pub fn run(&self, chapter: &ChapterRef, destination: &Path) -> ChapterOutcome {
        let mut state = ChapterState::Pending;
        let outcome = self.drive(chapter, destination, &mut state);
        match &outcome {
            ChapterOutcome::Success { manifest, partial } => {
                state = ChapterState::Done(manifest.archive_path.clone());
                if let Some((ok, total)) = partial {
                    warn!("{}: 部分完成 {}/{} 张图片", chapter.display_name, ok, total);
                }
            }
            ChapterOutcome::Failure { stage, reason } => {
                state = ChapterState::Failed {
                    stage: *stage,
                    reason: reason.clone(),
                };
                error!(
                    "{} 在 {} 阶段失败 <{}>: {}",
                    chapter.display_name, stage, chapter.source_url, reason
                );
            }
        }
        debug!("{}: 最终状态 {:?}（{}）", chapter.display_name, state, state.stage());
        outcome
    }

    fn drive(
        &self,
        chapter: &ChapterRef,
        destination: &Path,
        state: &mut ChapterState,
    ) -> ChapterOutcome {
        advance(state, ChapterState::Resolving, chapter);
        let locations = match self.resolver.resolve(self.fetcher, &chapter.source_url) {
            Ok(l) if l.is_empty() => return failure(Stage::Resolving, &ResolutionError::NoImagesFound),
            Ok(l) => l,
            Err(e) => return failure(Stage::Resolving, &e),
        };
        let total = locations.len();

        // 暂存目录随 TempDir 析构删除，覆盖成功、失败与提前返回
        let scratch = match self.scratch_dir() {
            Ok(dir) => dir,
            Err(e) => return failure(Stage::Downloading, &e),
        };
        advance(state, ChapterState::Downloading { total }, chapter);
        info!("下载 {}（{} 张图片）", chapter.display_name, total);

        let progress = ChapterProgress::new(&chapter.display_name, total, self.show_progress);
        let report = self.downloader.download_all(
            &locations,
            scratch.path(),
            self.concurrency_limit,
            &mut |done| progress.set_completed(done),
        );
        progress.finish();

        if report.succeeded == 0 {
            return ChapterOutcome::Failure {
                stage: Stage::Downloading,
                reason: format!("all {total} images failed to download"),
            };
        }
        if report.is_partial() {
            warn!(
                "{}: {}/{} 张图片下载成功，失败序号 {:?}",
                chapter.display_name,
                report.succeeded,
                total,
                report.failed_ordinals.iter().map(|o| o + 1).collect::<Vec<_>>()
            );
        }

        advance(
            state,
            ChapterState::Archiving {
                succeeded: report.succeeded,
                total,
            },
            chapter,
        );
        match self
            .archiver
            .archive(scratch.path(), &chapter.display_name, destination)
        {
            Ok(manifest) => {
                let staged = report.staged_files();
                if manifest.entry_count != staged.len() {
                    warn!(
                        "{}: 归档 {} 项，与下载成功的 {} 个文件不一致",
                        chapter.display_name,
                        manifest.entry_count,
                        staged.len()
                    );
                }
                ChapterOutcome::Success {
                    manifest,
                    partial: report.is_partial().then_some((report.succeeded, total)),
                }
            }
            Err(e) => failure(Stage::Archiving, &e),
        }
    }

    fn scratch_dir(&self) -> std::io::Result<TempDir> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix(SCRATCH_PREFIX);
            b
        };
        match self.scratch_root.as_ref() {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
    }
}

fn advance(state: &mut ChapterState, next: ChapterState, chapter: &ChapterRef) {
    debug!("{}: {:?} -> {:?}", chapter.display_name, state, next);
    *state = next;
}

fn failure(stage: Stage, err: &dyn Error) -> ChapterOutcome {
    ChapterOutcome::Failure {
        stage,
        reason: error_chain(err),
    }
}

/// 拼接错误及其 source 链，便于不重跑就能定位原因。
pub fn error_chain(err: &dyn Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}
