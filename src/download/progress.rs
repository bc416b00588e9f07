//! 进度上报与 CLI 进度条管理。

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// 单章图片下载进度条；`enabled = false` 时不绘制。
pub struct ChapterProgress {
    bar: Option<ProgressBar>,
}

impl ChapterProgress {
    pub fn new(label: &str, total: usize, enabled: bool) -> Self {
        if !enabled || total == 0 {
            return Self { bar: None };
        }
        let style = ProgressStyle::with_template(
            "{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");

        let bar = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::stderr());
        bar.set_style(style);
        bar.set_prefix(label.to_string());
        Self { bar: Some(bar) }
    }

    /// 完成数单调递增，直接设置位置。
    pub fn set_completed(&self, completed: usize) {
        if let Some(bar) = self.bar.as_ref() {
            bar.set_position(completed as u64);
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = self.bar.as_ref() {
            bar.finish_and_clear();
        }
    }
}

impl Drop for ChapterProgress {
    fn drop(&mut self) {
        self.finish();
    }
}
