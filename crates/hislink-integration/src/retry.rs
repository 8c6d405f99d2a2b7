//! 重试引擎
//!
//! 有界指数退避：最多执行 `max_retries + 1` 次，每次重试前等待当前延迟，
//! 随后延迟乘以 `backoff_multiplier` 并以 `max_delay_ms` 封顶。
//! 不可重试的错误立即返回。

use hislink_core::{Result, RetryConfig};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// 按重试策略执行操作
///
/// 可重试错误只会在所有尝试耗尽后返回，因此调用方可以通过
/// `retryable()` 区分“耗尽”与“立即失败”。
pub async fn execute_with_retry<T, F, Fut>(
    config: &RetryConfig,
    context: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_delay_ms = config.max_delay_ms as f64;
    let mut delay_ms = (config.initial_delay_ms as f64).min(max_delay_ms);
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            debug!(
                operation = context,
                attempt,
                delay_ms = delay_ms as u64,
                "retrying after delay"
            );
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
            delay_ms = (delay_ms * config.backoff_multiplier).min(max_delay_ms);
        }

        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = context, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.retryable() => {
                warn!(
                    operation = context,
                    attempt,
                    code = err.code(),
                    error = %err,
                    "non-retryable failure, giving up"
                );
                return Err(err);
            }
            Err(err) => {
                if attempt >= config.max_retries {
                    error!(
                        operation = context,
                        attempts = attempt + 1,
                        error = %err,
                        "all retry attempts exhausted"
                    );
                    return Err(err);
                }
                warn!(
                    operation = context,
                    attempt,
                    error = %err,
                    "operation failed, will retry"
                );
                attempt += 1;
            }
        }
    }
}
