//! 单章图片并发下载工作池。
//!
//! 固定数量的工作线程从有界队列取任务，共享同一个 `Fetch`。
//! 每张图片独立重试，写入临时文件后原子改名为 `NNNN.<ext>`。

use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crossbeam_channel as channel;
use tracing::{debug, warn};

use super::models::{DownloadError, DownloadOutcome, DownloadReport, DownloadResult, ImageLocation};
use crate::base_system::context::Config;
use crate::base_system::cooldown_retry::{Attempt, Backoff, run_with_backoff};
use crate::network_parser::network::{Fetch, FetchError, FetchPolicy};

const IMAGE_BACKOFF_CAP: Duration = Duration::from_secs(120);

pub struct ConcurrentDownloader<'a> {
    fetcher: &'a dyn Fetch,
    policy: FetchPolicy,
    max_attempts: u32,
    backoff: Backoff,
    extension: String,
}

impl<'a> ConcurrentDownloader<'a> {
    pub fn new(fetcher: &'a dyn Fetch, config: &Config) -> Self {
        Self {
            fetcher,
            policy: config.image_policy(),
            max_attempts: config.image_max_attempts.max(1),
            backoff: Backoff::new(config.image_backoff(), IMAGE_BACKOFF_CAP),
            extension: config.image_ext().to_string(),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Backoff) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// 下载全部图片后返回；每个位置都会得到一条结果。
    ///
    /// `on_progress` 收到单调递增的完成数，成功与失败都计入。
    pub fn download_all(
        &self,
        locations: &[ImageLocation],
        destination: &Path,
        concurrency_limit: usize,
        on_progress: &mut dyn FnMut(usize),
    ) -> DownloadReport {
        let total = locations.len();
        if total == 0 {
            return DownloadReport::default();
        }
        let workers = concurrency_limit.clamp(1, total);
        debug!("开始下载 {} 张图片，并发 {}", total, workers);

        let (tx_jobs, rx_jobs) = channel::bounded::<&ImageLocation>(workers * 2);
        let (tx_res, rx_res) = channel::unbounded::<DownloadResult>();
        let mut results = Vec::with_capacity(total);

        thread::scope(|scope| {
            for _ in 0..workers {
                let rx = rx_jobs.clone();
                let tx = tx_res.clone();
                scope.spawn(move || {
                    for location in rx {
                        if tx.send(self.download_one(location, destination)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(rx_jobs);
            drop(tx_res);

            scope.spawn(move || {
                for location in locations {
                    if tx_jobs.send(location).is_err() {
                        break;
                    }
                }
            });

            for result in rx_res.iter() {
                results.push(result);
                on_progress(results.len());
            }
        });

        build_report(total, results)
    }

    fn download_one(&self, location: &ImageLocation, destination: &Path) -> DownloadResult {
        let final_path = destination.join(location.file_name(&self.extension));
        let outcome = run_with_backoff(
            self.max_attempts,
            self.backoff,
            |_| self.fetch_and_store(location, destination, &final_path),
            |attempt, err, wait| {
                warn!(
                    "图片 {} 第 {}/{} 次下载失败: {}，{:?} 后重试",
                    location.ordinal + 1,
                    attempt + 1,
                    self.max_attempts,
                    err,
                    wait
                );
            },
        );

        match outcome {
            Ok(()) => DownloadResult {
                ordinal: location.ordinal,
                local_path: Some(final_path),
                outcome: DownloadOutcome::Ok,
            },
            Err(exhausted) => {
                warn!(
                    "图片 {} 下载失败（{} 次尝试）: {} <{}>",
                    location.ordinal + 1,
                    exhausted.attempts,
                    exhausted.last,
                    location.url
                );
                let err = if exhausted.attempts > 1 {
                    DownloadError::Exhausted {
                        attempts: exhausted.attempts,
                        last: exhausted.last.to_string(),
                    }
                } else {
                    exhausted.last
                };
                DownloadResult {
                    ordinal: location.ordinal,
                    local_path: None,
                    outcome: DownloadOutcome::Failed(err),
                }
            }
        }
    }

    fn fetch_and_store(
        &self,
        location: &ImageLocation,
        destination: &Path,
        final_path: &Path,
    ) -> Result<(), Attempt<DownloadError>> {
        let bytes = self
            .fetcher
            .fetch(&location.url, &self.policy)
            .map_err(|err| match err {
                FetchError::InvalidUrl { .. } => Attempt::Abort(err.into()),
                other => Attempt::Retry(other.into()),
            })?;
        if bytes.is_empty() {
            return Err(Attempt::Retry(DownloadError::EmptyBody));
        }
        write_atomic(destination, final_path, &bytes).map_err(Attempt::Abort)
    }
}

/// 先写同目录下的 `*.tmp` 临时文件，刷盘后再改名到最终路径。
pub(crate) fn write_atomic(dir: &Path, final_path: &Path, bytes: &[u8]) -> Result<(), DownloadError> {
    let write_err = |path: PathBuf| move |source: std::io::Error| DownloadError::Write { path, source };
    let prefix = final_path
        .file_name()
        .map(|n| format!("{}.", n.to_string_lossy()))
        .unwrap_or_default();

    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(write_err(dir.to_path_buf()))?;
    let tmp_path = tmp.path().to_path_buf();
    tmp.write_all(bytes).map_err(write_err(tmp_path.clone()))?;
    tmp.as_file().sync_all().map_err(write_err(tmp_path))?;
    tmp.persist(final_path)
        .map_err(|e| DownloadError::Write {
            path: final_path.to_path_buf(),
            source: e.error,
        })?;
    Ok(())
}

fn build_report(total: usize, mut results: Vec<DownloadResult>) -> DownloadReport {
    results.sort_by_key(|r| r.ordinal);
    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let failed_ordinals = results
        .iter()
        .filter(|r| !r.is_ok())
        .map(|r| r.ordinal)
        .collect();
    DownloadReport {
        total,
        succeeded,
        failed_ordinals,
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_parser::testing::StaticFetcher;

    fn locations(n: usize) -> Vec<ImageLocation> {
        (0..n)
            .map(|i| ImageLocation {
                ordinal: i,
                url: format!("https://img.example/{i}.jpg"),
            })
            .collect()
    }

    fn downloader(fetcher: &dyn Fetch) -> ConcurrentDownloader<'_> {
        ConcurrentDownloader::new(fetcher, &Config::default())
            .with_retry(5, Backoff::new(Duration::ZERO, Duration::ZERO))
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn failed_image_keeps_its_gap() {
        let fetcher = StaticFetcher::new()
            .with_page("https://img.example/0.jpg", b"zero".to_vec())
            .with_failure("https://img.example/1.jpg", 503)
            .with_page("https://img.example/2.jpg", b"two".to_vec());
        let dir = tempfile::tempdir().unwrap();

        let mut seen = Vec::new();
        let report = downloader(&fetcher).download_all(&locations(3), dir.path(), 10, &mut |n| seen.push(n));

        assert_eq!(report.total, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed_ordinals, vec![1]);
        assert_eq!(fetcher.hits("https://img.example/1.jpg"), 5);
        assert_eq!(names_in(dir.path()), vec!["0001.jpg", "0003.jpg"]);
        assert_eq!(
            report.staged_files(),
            vec![dir.path().join("0001.jpg"), dir.path().join("0003.jpg")]
        );
        assert_eq!(std::fs::read(dir.path().join("0003.jpg")).unwrap(), b"two");
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn partial_failure_counts() {
        let mut fetcher = StaticFetcher::new();
        for i in 0..10 {
            let url = format!("https://img.example/{i}.jpg");
            fetcher = if i == 3 || i == 7 {
                fetcher.with_failure(&url, 404)
            } else {
                fetcher.with_page(&url, vec![i as u8 + 1])
            };
        }
        let dir = tempfile::tempdir().unwrap();
        let report = downloader(&fetcher).download_all(&locations(10), dir.path(), 3, &mut |_| {});

        assert_eq!(report.succeeded, 8);
        assert_eq!(report.failed_ordinals, vec![3, 7]);
        assert_eq!(report.results.len(), 10);
        assert!(report.results.windows(2).all(|w| w[0].ordinal < w[1].ordinal));
        assert_eq!(names_in(dir.path()).len(), 8);
    }

    #[test]
    fn empty_body_is_retried_then_failed() {
        let fetcher = StaticFetcher::new().with_page("https://img.example/0.jpg", Vec::new());
        let dir = tempfile::tempdir().unwrap();
        let report = downloader(&fetcher).download_all(&locations(1), dir.path(), 1, &mut |_| {});
        assert_eq!(report.succeeded, 0);
        assert_eq!(fetcher.hits("https://img.example/0.jpg"), 5);
        assert!(names_in(dir.path()).is_empty());
    }

    #[test]
    fn single_worker_still_finishes_everything() {
        let mut fetcher = StaticFetcher::new();
        for i in 0..25 {
            fetcher = fetcher.with_page(&format!("https://img.example/{i}.jpg"), b"x".to_vec());
        }
        let dir = tempfile::tempdir().unwrap();
        let mut last = 0;
        let report = downloader(&fetcher).download_all(&locations(25), dir.path(), 1, &mut |n| {
            assert!(n > last);
            last = n;
        });
        assert_eq!(report.succeeded, 25);
        assert_eq!(last, 25);
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("0001.jpg");
        write_atomic(dir.path(), &target, b"data").unwrap();
        assert_eq!(names_in(dir.path()), vec!["0001.jpg"]);

        let missing = dir.path().join("nope");
        assert!(matches!(
            write_atomic(&missing, &missing.join("0002.jpg"), b"x"),
            Err(DownloadError::Write { .. })
        ));
    }
}
