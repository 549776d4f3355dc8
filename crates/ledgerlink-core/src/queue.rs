//! # queue：跨重连保存写操作的队列
//!
//! ## 核心意图（Why）
//! - 调用方提交的追加操作在链路抖动期间不能丢失，也不能在成功确认后被再次投递；
//! - 队列只由控制器任务访问，因此内部无需任何锁。
//!
//! ## 行为契约（What）
//! - **两段结构**：`pending`（等待发送，按提交序号排序）与 `in_flight`（已发送，以关联 ID 索引）；
//!   需要等到下一次检查周期再投递的重试操作以“搁置”标记留在 `pending` 原位；
//! - **同流顺序**：搁置中的操作挡住同一流上所有更晚提交的操作，重试永远不会被后来者超车；
//! - **关联 ID**：每次发送都分配全新的 ID，旧 ID 对应的迟到应答找不到条目，只会被忽略；
//! - **重试预算**：每次重新投递扣减一次；已用次数达到上限后再需要重试时，
//!   以 [`ConnectionError::RetryExhausted`] 结束，`last` 为触发本次重试的瞬时原因；
//! - **关闭**：[`OperationQueue::fail_all`] 让所有未决操作以同一错误结束。
//!
//! ## 风险提示（Trade-offs）
//! - 不做客户端去重：已提交但确认丢失的写在重试后可能被服务端以版本冲突拒绝，
//!   调用方选择的期望版本是唯一的真相来源。

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use tokio::{sync::oneshot, time::Instant};
use tracing::debug;

use crate::{
    endpoint::Endpoint,
    error::ConnectionError,
    protocol::{
        AppendRequest, CorrelationId, NotHandledReason, Request, RequestBody, ResponseBody,
        WriteResult,
    },
    settings::ConnectionSettings,
};

/// 写操作的完成通道。
pub(crate) type Completion = oneshot::Sender<Result<WriteResult, ConnectionError>>;

/// 队列中的单个写操作。
struct Operation {
    seq: u64,
    request: AppendRequest,
    retries: u32,
    sent_at: Option<Instant>,
    /// 等待下一次检查周期才允许再次投递。
    parked: bool,
    reply: Completion,
}

impl Operation {
    fn finish(self, outcome: Result<WriteResult, ConnectionError>) {
        if self.reply.send(outcome).is_err() {
            debug!(stream = %self.request.stream, "caller stopped waiting for append result");
        }
    }
}

/// 应答处理结果，控制器据此决定是否需要切换节点。
#[derive(Debug)]
pub(crate) enum ReplyOutcome {
    /// 操作已结束（成功或不可重试的失败）。
    Completed,
    /// 操作已重新排队（或预算耗尽而结束），`cause` 为触发重试的瞬时原因。
    Retried { cause: ConnectionError },
    /// 服务端指明了 Leader，操作已回到等待队列，控制器应改连该节点。
    NotLeader {
        leader: Endpoint,
        cause: ConnectionError,
    },
    /// 关联 ID 不属于任何在途操作。
    Unknown,
}

pub(crate) struct OperationQueue {
    settings: Arc<ConnectionSettings>,
    next_seq: u64,
    next_correlation: u64,
    pending: VecDeque<Operation>,
    in_flight: HashMap<CorrelationId, Operation>,
}

impl OperationQueue {
    pub(crate) fn new(settings: Arc<ConnectionSettings>) -> Self {
        Self {
            settings,
            next_seq: 0,
            next_correlation: 0,
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// 分配一个全新的关联 ID（心跳探测与写操作共用同一序列）。
    pub(crate) fn next_correlation(&mut self) -> CorrelationId {
        self.next_correlation += 1;
        CorrelationId::new(self.next_correlation)
    }

    /// 提交写操作；超过队列容量时立即以 `QueueOverflow` 结束。
    pub(crate) fn enqueue(&mut self, request: AppendRequest, reply: Completion) {
        let capacity = self.settings.max_queue_size;
        if self.len() >= capacity {
            let _ = reply.send(Err(ConnectionError::QueueOverflow { capacity }));
            return;
        }
        self.next_seq += 1;
        self.pending.push_back(Operation {
            seq: self.next_seq,
            request,
            retries: 0,
            sent_at: None,
            parked: false,
            reply,
        });
    }

    /// 在并发上限内按提交顺序把等待中的操作交给 `send`；`send` 返回 `false` 时停止并保留该操作。
    ///
    /// 搁置中的操作原地等待，并挡住同一流上排在它之后的操作。
    pub(crate) fn dispatch(&mut self, now: Instant, mut send: impl FnMut(Request) -> bool) -> usize {
        let mut dispatched = 0;
        let mut blocked: HashSet<String> = HashSet::new();
        let mut index = 0;
        while index < self.pending.len() && self.in_flight.len() < self.settings.max_concurrent_items {
            let op = &self.pending[index];
            if op.reply.is_closed() {
                debug!(stream = %op.request.stream, "dropping append abandoned by caller");
                self.pending.remove(index);
                continue;
            }
            if op.parked || blocked.contains(&op.request.stream) {
                blocked.insert(op.request.stream.clone());
                index += 1;
                continue;
            }
            let Some(mut op) = self.pending.remove(index) else {
                break;
            };
            let correlation = self.next_correlation();
            let request = Request {
                correlation,
                body: RequestBody::Append(op.request.clone()),
            };
            if !send(request) {
                self.pending.insert(index, op);
                break;
            }
            op.sent_at = Some(now);
            debug!(stream = %op.request.stream, %correlation, retries = op.retries, "append dispatched");
            self.in_flight.insert(correlation, op);
            dispatched += 1;
        }
        dispatched
    }

    /// 处理服务端对写操作的应答。
    pub(crate) fn complete(&mut self, correlation: CorrelationId, body: ResponseBody) -> ReplyOutcome {
        let Some(op) = self.in_flight.remove(&correlation) else {
            return ReplyOutcome::Unknown;
        };
        let stream = op.request.stream.clone();
        match body {
            ResponseBody::AppendCompleted(result) => {
                op.finish(Ok(result));
                ReplyOutcome::Completed
            }
            ResponseBody::WrongExpectedVersion { current } => {
                let expected = op.request.expected_version;
                op.finish(Err(ConnectionError::WrongExpectedVersion {
                    stream,
                    expected,
                    actual: current,
                }));
                ReplyOutcome::Completed
            }
            ResponseBody::StreamDeleted => {
                op.finish(Err(ConnectionError::StreamDeleted { stream }));
                ReplyOutcome::Completed
            }
            ResponseBody::AccessDenied => {
                op.finish(Err(ConnectionError::AccessDenied { stream }));
                ReplyOutcome::Completed
            }
            ResponseBody::BadRequest { detail } => {
                op.finish(Err(ConnectionError::BadRequest { stream, detail }));
                ReplyOutcome::Completed
            }
            ResponseBody::NotHandled(reason) => {
                let cause = ConnectionError::NotHandled {
                    stream,
                    reason: reason.to_string(),
                };
                match reason {
                    NotHandledReason::NotLeader {
                        leader: Some(leader),
                    } => {
                        self.retry_now(op, cause.clone());
                        ReplyOutcome::NotLeader { leader, cause }
                    }
                    NotHandledReason::NotLeader { leader: None }
                    | NotHandledReason::NotReady
                    | NotHandledReason::TooBusy => {
                        self.retry_later(op, cause.clone());
                        ReplyOutcome::Retried { cause }
                    }
                }
            }
            ResponseBody::HeartbeatRequest | ResponseBody::HeartbeatResponse => {
                op.finish(Err(ConnectionError::Protocol {
                    detail: format!("heartbeat frame answered append {correlation}"),
                }));
                ReplyOutcome::Completed
            }
        }
    }

    /// 是否存在超过操作超时仍未应答的在途操作。
    pub(crate) fn has_expired(&self, now: Instant) -> bool {
        let timeout = self.settings.operation_timeout;
        self.in_flight
            .values()
            .any(|op| op.sent_at.is_some_and(|at| now.duration_since(at) >= timeout))
    }

    /// 把超时的在途操作搁置回等待队列（扣减预算），返回第一个超时原因。
    pub(crate) fn expire(&mut self, now: Instant) -> Option<ConnectionError> {
        let timeout = self.settings.operation_timeout;
        let mut expired: Vec<(u64, CorrelationId)> = self
            .in_flight
            .iter()
            .filter(|(_, op)| op.sent_at.is_some_and(|at| now.duration_since(at) >= timeout))
            .map(|(correlation, op)| (op.seq, *correlation))
            .collect();
        expired.sort_unstable();

        let mut first = None;
        for (_, correlation) in expired {
            let Some(op) = self.in_flight.remove(&correlation) else {
                continue;
            };
            let elapsed = op.sent_at.map_or(timeout, |at| now.duration_since(at));
            let cause = ConnectionError::NoServerResponse {
                stream: op.request.stream.clone(),
                elapsed,
            };
            debug!(stream = %op.request.stream, %correlation, ?elapsed, "append timed out");
            if first.is_none() {
                first = Some(cause.clone());
            }
            self.retry_later(op, cause);
        }
        first
    }

    /// 会话丢失：所有在途操作回到等待队列（扣减预算）。
    pub(crate) fn requeue_in_flight(&mut self, cause: &ConnectionError) {
        let mut ops: Vec<Operation> = self.in_flight.drain().map(|(_, op)| op).collect();
        ops.sort_unstable_by_key(|op| op.seq);
        for op in ops {
            self.retry_now(op, cause.clone());
        }
    }

    /// 解除全部搁置，下一次 `dispatch` 起可再次投递。
    pub(crate) fn release_parked(&mut self) {
        for op in self.pending.iter_mut() {
            op.parked = false;
        }
    }

    /// 以同一错误结束全部未决操作。
    pub(crate) fn fail_all(&mut self, error: &ConnectionError) {
        let in_flight: Vec<Operation> = self.in_flight.drain().map(|(_, op)| op).collect();
        for op in self.pending.drain(..).chain(in_flight) {
            op.finish(Err(error.clone()));
        }
    }

    fn retry_now(&mut self, op: Operation, cause: ConnectionError) {
        if let Some(op) = self.charge(op, cause) {
            self.insert_pending(op);
        }
    }

    fn retry_later(&mut self, op: Operation, cause: ConnectionError) {
        if let Some(mut op) = self.charge(op, cause) {
            op.parked = true;
            self.insert_pending(op);
        }
    }

    /// 扣减一次重试预算；预算耗尽时结束操作并返回 `None`。
    fn charge(&mut self, mut op: Operation, cause: ConnectionError) -> Option<Operation> {
        if self.settings.max_retries.is_exhausted_by(op.retries) {
            let retries = op.retries;
            let stream = op.request.stream.clone();
            op.finish(Err(ConnectionError::RetryExhausted {
                stream,
                retries,
                last: Box::new(cause),
            }));
            return None;
        }
        op.retries += 1;
        op.sent_at = None;
        Some(op)
    }

    fn insert_pending(&mut self, op: Operation) {
        let index = self.pending.partition_point(|queued| queued.seq < op.seq);
        self.pending.insert(index, op);
    }
}
