//! 冷却/退避重试策略。
//!
//! 传输层（Fetcher）与语义层（章节页、单张图片）各自套一层，
//! 两层都用这里的指数退避。

use std::time::Duration;

const MAX_SHIFT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
        }
    }

    /// 第 `attempt` 次失败（从 0 开始）之后的等待时长：`base * 2^attempt`，封顶 `cap`。
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_SHIFT);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn sleep(&self, attempt: u32) {
        let wait = self.delay(attempt);
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}

/// 单次尝试的失败结果：可重试或立即放弃。
#[derive(Debug)]
pub enum Attempt<E> {
    Retry(E),
    Abort(E),
}

#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

/// 最多执行 `max_attempts` 次 `op`，两次之间按 `backoff` 退避。
///
/// `on_retry(attempt, &err, wait)` 在每次退避前调用，便于记录日志。
pub fn run_with_backoff<T, E>(
    max_attempts: u32,
    backoff: Backoff,
    mut op: impl FnMut(u32) -> Result<T, Attempt<E>>,
    mut on_retry: impl FnMut(u32, &E, Duration),
) -> Result<T, Exhausted<E>> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(Attempt::Abort(last)) => {
                return Err(Exhausted {
                    attempts: attempt + 1,
                    last,
                });
            }
            Err(Attempt::Retry(last)) => {
                if attempt + 1 >= max_attempts {
                    return Err(Exhausted {
                        attempts: attempt + 1,
                        last,
                    });
                }
                on_retry(attempt, &last, backoff.delay(attempt));
                backoff.sleep(attempt);
                attempt += 1;
            }
        }
    }
}
