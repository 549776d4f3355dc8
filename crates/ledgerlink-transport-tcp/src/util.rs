use std::future::Future;
use std::io;
use std::time::Duration;

use ledgerlink_core::{ConnectionError, ResolvedEndpoint};

use crate::error::{OperationKind, map_io_error, timeout_error};

/// 在时限内执行一次 IO Future，并把结果统一映射为 [`ConnectionError`]。
///
/// # 契约（What）
/// - `timeout` 为零表示不设时限；
/// - 超时返回 `ConnectTimeout`，IO 失败按 `kind` 经 [`map_io_error`] 分类。
///
/// # 实现（How）
/// - 与 `tokio::time::timeout` 不同，这里用 `biased` 的 `select!` 优先轮询业务 Future，
///   保证同一轮中“已完成”优先于“已超时”，避免临界点上丢弃一条已经建好的链路。
pub(crate) async fn run_with_timeout<F, T>(
    kind: OperationKind,
    endpoint: &ResolvedEndpoint,
    timeout: Duration,
    future: F,
) -> Result<T, ConnectionError>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::pin!(future);
    if timeout.is_zero() {
        return future.await.map_err(|err| map_io_error(kind, err));
    }
    let sleep = tokio::time::sleep(timeout);
    tokio::pin!(sleep);
    tokio::select! {
        biased;
        result = &mut future => result.map_err(|err| map_io_error(kind, err)),
        _ = &mut sleep => Err(timeout_error(endpoint, timeout)),
    }
}
