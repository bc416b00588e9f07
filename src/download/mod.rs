//! 下载流程模块入口。
//!
//! 子模块：
//! - `models`       ：数据模型（ChapterRef / ImageLocation / DownloadReport 等）
//! - `image_pool`   ：单章图片并发下载工作池
//! - `progress`     ：CLI 进度条
//! - `orchestrator` ：单章 解析 → 下载 → 打包 编排
//! - `batch`        ：多章节循环与失败策略

pub mod batch;
pub mod image_pool;
pub mod models;
pub mod orchestrator;
pub mod progress;

pub use batch::{BatchPolicy, run_batch};
pub use orchestrator::ChapterOrchestrator;
