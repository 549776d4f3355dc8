//! # session：一条活跃链路及其读写任务
//!
//! ## 设计动机（Why）
//! - 链路上的读与写必须互不阻塞：写任务排空出站队列，读任务把每个应答转交控制器；
//! - 任何一侧失败都意味着整条会话作废，但读写两侧可能几乎同时报错，控制器只应收到一次通知，
//!   因此以原子“死亡标记”做一次性上报。
//!
//! ## 契约（What）
//! - 会话只由控制器持有；重连时旧会话被标记死亡并中止任务，新会话以新的 [`SessionId`] 安装；
//! - 读任务转交的每个事件都带会话 ID，控制器据此丢弃已替换会话的迟到帧；
//! - [`Session::send`] 在会话已死亡时返回 `false`，调用方据此把请求留在队列中。
//!
//! ## 注意事项（Trade-offs）
//! - 出站通道无界，背压由队列的并发上限（`max_concurrent_items`）间接提供。

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::debug;

use crate::{
    endpoint::ResolvedEndpoint,
    error::ConnectionError,
    protocol::{Request, Response},
    transport::Link,
};

/// 会话标识，单个连接内单调递增。
pub(crate) type SessionId = u64;

/// 会话任务发给控制器的事件。
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Received {
        session: SessionId,
        response: Response,
    },
    Failed {
        session: SessionId,
        error: ConnectionError,
    },
}

/// 一次性失败上报器，读写任务各持一份。
#[derive(Clone)]
struct FailureReporter {
    session: SessionId,
    dead: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl FailureReporter {
    fn report(&self, error: ConnectionError) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.events.send(SessionEvent::Failed {
            session: self.session,
            error,
        });
    }
}

pub(crate) struct Session {
    id: SessionId,
    endpoint: ResolvedEndpoint,
    link: Arc<dyn Link>,
    outbound: mpsc::UnboundedSender<Request>,
    dead: Arc<AtomicBool>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    /// 最近一次收到任意入站帧的时刻，由控制器更新。
    pub(crate) last_received: Instant,
    /// 当前静默窗口内是否已发出心跳探测。
    pub(crate) heartbeat_sent: bool,
}

impl Session {
    /// 在已建立的链路上启动读写任务。
    pub(crate) fn start(
        id: SessionId,
        endpoint: ResolvedEndpoint,
        link: Box<dyn Link>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let link: Arc<dyn Link> = Arc::from(link);
        let dead = Arc::new(AtomicBool::new(false));
        let reporter = FailureReporter {
            session: id,
            dead: Arc::clone(&dead),
            events: events.clone(),
        };
        let (outbound, mut requests) = mpsc::unbounded_channel::<Request>();

        let writer_link = Arc::clone(&link);
        let writer_reporter = reporter.clone();
        let writer = tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                if let Err(err) = writer_link.send(request).await {
                    writer_reporter.report(err);
                    return;
                }
            }
        });

        let reader_link = Arc::clone(&link);
        let reader = tokio::spawn(async move {
            loop {
                match reader_link.receive().await {
                    Ok(response) => {
                        if events
                            .send(SessionEvent::Received {
                                session: id,
                                response,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(err) => {
                        reporter.report(err);
                        return;
                    }
                }
            }
        });

        Self {
            id,
            endpoint,
            link,
            outbound,
            dead,
            writer,
            reader,
            last_received: Instant::now(),
            heartbeat_sent: false,
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn endpoint(&self) -> &ResolvedEndpoint {
        &self.endpoint
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// 把请求交给写任务；会话已死亡时返回 `false`。
    pub(crate) fn send(&self, request: Request) -> bool {
        !self.is_dead() && self.outbound.send(request).is_ok()
    }

    /// 标记死亡、中止读写任务并异步关闭链路。
    pub(crate) fn shutdown(self) {
        self.dead.store(true, Ordering::Release);
        self.writer.abort();
        self.reader.abort();
        let link = Arc::clone(&self.link);
        let session = self.id;
        tokio::spawn(async move {
            link.close().await;
            debug!(session, "session link closed");
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dead.store(true, Ordering::Release);
        self.writer.abort();
        self.reader.abort();
    }
}
