//! 多章节批处理循环。
//!
//! 章节逐个顺序处理（并行只发生在单章图片内部）。收到中断后不再开始新章节，
//! 正在处理的章节照常完成。

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use super::models::{BatchSummary, ChapterRef};
use super::orchestrator::ChapterOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchPolicy {
    /// 失败章节跳过，继续下一章
    #[default]
    ContinueOnError,
    HaltOnError,
}

impl BatchPolicy {
    pub fn from_flag(halt_on_error: bool) -> Self {
        if halt_on_error {
            Self::HaltOnError
        } else {
            Self::ContinueOnError
        }
    }
}

pub fn run_batch(
    orchestrator: &ChapterOrchestrator<'_>,
    chapters: &[ChapterRef],
    destination_for: impl Fn(&ChapterRef) -> PathBuf,
    policy: BatchPolicy,
    cancel: &AtomicBool,
) -> BatchSummary {
    let mut summary = BatchSummary::default();

    for (idx, chapter) in chapters.iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            summary.cancelled = true;
            summary.skipped = chapters.len() - idx;
            warn!("已中断，剩余 {} 章未处理", summary.skipped);
            break;
        }

        info!("[{}/{}] {}", idx + 1, chapters.len(), chapter.display_name);
        let outcome = orchestrator.run(chapter, &destination_for(chapter));
        let failed = !outcome.is_success();
        summary.outcomes.push((chapter.clone(), outcome));

        if failed && policy == BatchPolicy::HaltOnError {
            summary.skipped = chapters.len() - idx - 1;
            warn!("halt_on_error 已开启，停止处理剩余 {} 章", summary.skipped);
            break;
        }
    }

    summary
}
