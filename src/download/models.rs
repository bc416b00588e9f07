//! 下载相关的数据模型定义。
//!
//! 包含章节引用、图片位置、单图下载结果、章节级下载报告、归档清单，
//! 以及章节状态机的阶段与最终结果。

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network_parser::network::FetchError;

/// 列表中的一章，列出后不再修改。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRef {
    pub display_name: String,
    pub source_url: String,
}

/// 单张图片的位置，`ordinal` 决定文件名与归档顺序。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLocation {
    pub ordinal: usize,
    pub url: String,
}

impl ImageLocation {
    /// `ordinal + 1` 补零到 4 位，例如序号 0 对应 `0001.jpg`。
    pub fn file_name(&self, ext: &str) -> String {
        format!("{:04}.{}", self.ordinal + 1, ext)
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("empty response body")]
    EmptyBody,
    #[error("write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

#[derive(Debug)]
pub enum DownloadOutcome {
    Ok,
    Failed(DownloadError),
}

/// 每个 `ImageLocation` 对应一条。
#[derive(Debug)]
pub struct DownloadResult {
    pub ordinal: usize,
    pub local_path: Option<PathBuf>,
    pub outcome: DownloadOutcome,
}

impl DownloadResult {
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, DownloadOutcome::Ok)
    }
}

/// 章节级汇总，`results` 按序号排序。
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed_ordinals: Vec<usize>,
    pub results: Vec<DownloadResult>,
}

impl DownloadReport {
    pub fn is_partial(&self) -> bool {
        self.succeeded < self.total
    }

    /// 成功写入暂存目录的文件，按序号排列。
    pub fn staged_files(&self) -> Vec<&Path> {
        self.results
            .iter()
            .filter_map(|r| r.local_path.as_deref())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveManifest {
    pub archive_path: PathBuf,
    pub entry_count: usize,
    pub source_chapter: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pending,
    Resolving,
    Downloading,
    Archiving,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Pending => "pending",
            Stage::Resolving => "resolving",
            Stage::Downloading => "downloading",
            Stage::Archiving => "archiving",
            Stage::Done => "done",
        };
        f.write_str(label)
    }
}

/// 章节状态机：`Pending → Resolving → Downloading → Archiving → Done`，
/// 任一阶段都可能转入 `Failed`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterState {
    Pending,
    Resolving,
    Downloading { total: usize },
    Archiving { succeeded: usize, total: usize },
    Done(PathBuf),
    Failed { stage: Stage, reason: String },
}

impl ChapterState {
    pub fn stage(&self) -> Stage {
        match self {
            ChapterState::Pending => Stage::Pending,
            ChapterState::Done(_) => Stage::Done,
            ChapterState::Resolving => Stage::Resolving,
            ChapterState::Downloading { .. } => Stage::Downloading,
            ChapterState::Archiving { .. } => Stage::Archiving,
            ChapterState::Failed { stage, .. } => *stage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterOutcome {
    Success {
        manifest: ArchiveManifest,
        /// 部分图片失败时为 `Some((成功数, 总数))`
        partial: Option<(usize, usize)>,
    },
    Failure {
        stage: Stage,
        reason: String,
    },
}

impl ChapterOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ChapterOutcome::Success { .. })
    }
}

/// 整批结束时的汇总。
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub outcomes: Vec<(ChapterRef, ChapterOutcome)>,
    /// 因中断或 halt 策略未处理的章节数
    pub skipped: usize,
    pub cancelled: bool,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_is_one_based_and_padded() {
        let loc = ImageLocation {
            ordinal: 0,
            url: "https://x/a.jpg".to_string(),
        };
        assert_eq!(loc.file_name("jpg"), "0001.jpg");
        let loc = ImageLocation {
            ordinal: 12_344,
            url: String::new(),
        };
        assert_eq!(loc.file_name("png"), "12345.png");
    }

    #[test]
    fn failed_state_keeps_its_stage() {
        let s = ChapterState::Failed {
            stage: Stage::Archiving,
            reason: "disk full".to_string(),
        };
        assert_eq!(s.stage(), Stage::Archiving);
        assert_eq!(Stage::Downloading.to_string(), "downloading");
    }
}
