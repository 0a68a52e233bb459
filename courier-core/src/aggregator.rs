//! 广播请求的机会式聚合
//!
//! 并发启动所有处理器调用，在截止时间前收集已完成的响应：
//! - 结果按完成顺序排列，失败或 panic 的调用不进入结果；
//! - 截止时间到达即返回已完成的子集，剩余任务被放弃，继续在后台运行直至结束，
//!   其结果被丢弃（不会向处理器发送取消信号）；
//! - 没有调用时立即返回空集合，不等待超时。
//!
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Instant};

/// 并发执行 `invocations`，返回截止时间前成功完成的结果
///
/// 超时从调用启动时开始计算；`Duration::MAX` 等无法表示的超时等同于等待全部完成。
pub async fn return_opportunistically<T, I, F>(invocations: I, timeout: Duration) -> Vec<T>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    // 超时过大无法表示为时间点时视为不设截止时间
    let deadline = Instant::now().checked_add(timeout);
    let mut pending: FuturesUnordered<_> = invocations.into_iter().map(tokio::spawn).collect();
    let mut completed = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let next = match deadline {
            Some(deadline) => time::timeout_at(deadline, pending.next()).await,
            None => Ok(pending.next().await),
        };
        match next {
            Ok(Some(Ok(Ok(response)))) => completed.push(response),
            Ok(Some(Ok(Err(err)))) => {
                tracing::debug!(error = %err, "广播请求的处理器失败，结果被排除");
            }
            Ok(Some(Err(join_err))) => {
                tracing::warn!(error = %join_err, "广播请求的处理器异常退出，结果被排除");
            }
            Ok(None) => break,
            Err(_) => {
                tracing::debug!(
                    completed = completed.len(),
                    abandoned = pending.len(),
                    "广播请求到达截止时间，放弃未完成的处理器"
                );
                break;
            }
        }
    }

    // 丢弃 JoinHandle 只会分离任务，不会取消它们
    drop(pending);

    completed
}
