//! # codec：长度前缀帧与消息体编码
//!
//! ## 帧布局（What）
//! ```text
//! +-----------+---------+-------+----------------+-----------+
//! | length:u32| cmd:u8  | flags | correlation:u64| payload   |
//! +-----------+---------+-------+----------------+-----------+
//!   (LE, 不含自身)
//! ```
//! - 所有整数均为小端序；字符串为 `u16` 长度 + UTF-8，二进制块为 `u32` 长度 + 字节；
//! - `flags` 的 [`FLAG_AUTHENTICATED`] 位表示负载以凭据（用户名、密码两个字符串）开头；
//! - `ExpectedVersion` 按核心库固定的线上整数编码（`Any = -2`、`NoStream = -1`、`StreamExists = -4`）。
//!
//! ## 设计取舍（Trade-offs）
//! - 解码是增量的：缓冲区不足一帧时返回 `Ok(None)` 并预留剩余容量，调用方继续读；
//! - 帧上限 [`MAX_FRAME_LEN`] 防止错位的长度字段让读端无限分配；
//! - 心跳命令在两个方向上复用同一组命令字，方向由调用哪一个 `decode_*` 决定。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ledgerlink_core::{
    AppendRequest, ClusterMember, CorrelationId, Endpoint, EventData, ExpectedVersion,
    NodeRole, NotHandledReason, Position, Request, RequestBody, Response, ResponseBody,
    StreamState, UserCredentials, WriteResult,
};
use uuid::Uuid;

use crate::error::CodecError;

const LENGTH_PREFIX: usize = 4;
const HEADER_LEN: usize = 1 + 1 + 8;

/// 单帧（不含长度前缀）允许的最大字节数。
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// 负载以凭据开头。
pub const FLAG_AUTHENTICATED: u8 = 0x01;

/// 命令字。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Command {
    HeartbeatRequest = 0x01,
    HeartbeatResponse = 0x02,
    WriteEvents = 0x82,
    WriteEventsCompleted = 0x83,
    GossipQuery = 0xA0,
    GossipReply = 0xA1,
    BadRequest = 0xF0,
    NotHandled = 0xF1,
}

impl TryFrom<u8> for Command {
    type Error = CodecError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        let command = match raw {
            0x01 => Command::HeartbeatRequest,
            0x02 => Command::HeartbeatResponse,
            0x82 => Command::WriteEvents,
            0x83 => Command::WriteEventsCompleted,
            0xA0 => Command::GossipQuery,
            0xA1 => Command::GossipReply,
            0xF0 => Command::BadRequest,
            0xF1 => Command::NotHandled,
            command => return Err(CodecError::UnknownCommand { command }),
        };
        Ok(command)
    }
}

/// 一个完整的线上帧。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub command: Command,
    pub flags: u8,
    pub correlation: CorrelationId,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: Command, correlation: CorrelationId, payload: Bytes) -> Self {
        Self {
            command,
            flags: 0,
            correlation,
            payload,
        }
    }

    /// 追加编码到 `dst`。
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        let length = HEADER_LEN + self.payload.len();
        if length > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge {
                length,
                limit: MAX_FRAME_LEN,
            });
        }
        dst.reserve(LENGTH_PREFIX + length);
        dst.put_u32_le(length as u32);
        dst.put_u8(self.command as u8);
        dst.put_u8(self.flags);
        dst.put_u64_le(self.correlation.get());
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// 从 `src` 头部切出一帧；数据不足时返回 `Ok(None)` 且不消费任何字节。
    pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let length = (&src[..LENGTH_PREFIX]).get_u32_le() as usize;
        if length < HEADER_LEN {
            return Err(CodecError::FrameTooShort { length });
        }
        if length > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge {
                length,
                limit: MAX_FRAME_LEN,
            });
        }
        let total = LENGTH_PREFIX + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX);
        let mut body = src.split_to(length).freeze();
        let command = Command::try_from(body.get_u8())?;
        let flags = body.get_u8();
        let correlation = CorrelationId::new(body.get_u64_le());
        Ok(Some(Frame {
            command,
            flags,
            correlation,
            payload: body,
        }))
    }
}

/// 客户端请求 → 帧。
pub fn encode_request(request: &Request) -> Result<Frame, CodecError> {
    let frame = match &request.body {
        RequestBody::HeartbeatRequest => {
            Frame::new(Command::HeartbeatRequest, request.correlation, Bytes::new())
        }
        RequestBody::HeartbeatResponse => {
            Frame::new(Command::HeartbeatResponse, request.correlation, Bytes::new())
        }
        RequestBody::Append(append) => {
            let mut payload = BytesMut::new();
            let mut flags = 0;
            if let Some(credentials) = &append.credentials {
                flags |= FLAG_AUTHENTICATED;
                put_string(&mut payload, "username", &credentials.username)?;
                put_string(&mut payload, "password", &credentials.password)?;
            }
            encode_append(append, &mut payload)?;
            Frame {
                flags,
                ..Frame::new(Command::WriteEvents, request.correlation, payload.freeze())
            }
        }
    };
    Ok(frame)
}

/// 帧 → 客户端请求（服务端方向）。
pub fn decode_request(frame: Frame) -> Result<Request, CodecError> {
    let correlation = frame.correlation;
    let body = match frame.command {
        Command::HeartbeatRequest => RequestBody::HeartbeatRequest,
        Command::HeartbeatResponse => RequestBody::HeartbeatResponse,
        Command::WriteEvents => {
            let mut reader = Reader::new(frame.payload);
            let credentials = if frame.flags & FLAG_AUTHENTICATED != 0 {
                let username = reader.string("username")?;
                let password = reader.string("password")?;
                Some(UserCredentials { username, password })
            } else {
                None
            };
            RequestBody::Append(decode_append(&mut reader, credentials)?)
        }
        other => {
            return Err(CodecError::UnexpectedCommand {
                command: other as u8,
            });
        }
    };
    Ok(Request { correlation, body })
}

/// 服务端应答 → 帧。
pub fn encode_response(response: &Response) -> Result<Frame, CodecError> {
    let mut payload = BytesMut::new();
    let command = match &response.body {
        ResponseBody::HeartbeatRequest => Command::HeartbeatRequest,
        ResponseBody::HeartbeatResponse => Command::HeartbeatResponse,
        ResponseBody::AppendCompleted(result) => {
            payload.put_u8(WriteOutcome::Success as u8);
            payload.put_u64_le(result.next_expected_version);
            payload.put_u64_le(result.log_position.commit);
            payload.put_u64_le(result.log_position.prepare);
            Command::WriteEventsCompleted
        }
        ResponseBody::WrongExpectedVersion { current } => {
            payload.put_u8(WriteOutcome::WrongExpectedVersion as u8);
            payload.put_i64_le(current.to_wire());
            Command::WriteEventsCompleted
        }
        ResponseBody::StreamDeleted => {
            payload.put_u8(WriteOutcome::StreamDeleted as u8);
            Command::WriteEventsCompleted
        }
        ResponseBody::AccessDenied => {
            payload.put_u8(WriteOutcome::AccessDenied as u8);
            Command::WriteEventsCompleted
        }
        ResponseBody::BadRequest { detail } => {
            put_string(&mut payload, "detail", detail)?;
            Command::BadRequest
        }
        ResponseBody::NotHandled(reason) => {
            match reason {
                NotHandledReason::NotReady => payload.put_u8(0),
                NotHandledReason::TooBusy => payload.put_u8(1),
                NotHandledReason::NotLeader { leader } => {
                    payload.put_u8(2);
                    match leader {
                        Some(leader) => {
                            payload.put_u8(1);
                            put_endpoint(&mut payload, "leader", leader)?;
                        }
                        None => payload.put_u8(0),
                    }
                }
            }
            Command::NotHandled
        }
    };
    Ok(Frame::new(command, response.correlation, payload.freeze()))
}

/// 帧 → 服务端应答（客户端方向）。
pub fn decode_response(frame: Frame) -> Result<Response, CodecError> {
    let correlation = frame.correlation;
    let mut reader = Reader::new(frame.payload);
    let body = match frame.command {
        Command::HeartbeatRequest => ResponseBody::HeartbeatRequest,
        Command::HeartbeatResponse => ResponseBody::HeartbeatResponse,
        Command::WriteEventsCompleted => match reader.u8("write outcome")? {
            0 => ResponseBody::AppendCompleted(WriteResult {
                next_expected_version: reader.u64("next expected version")?,
                log_position: Position::new(
                    reader.u64("commit position")?,
                    reader.u64("prepare position")?,
                ),
            }),
            1 => ResponseBody::WrongExpectedVersion {
                current: StreamState::from_wire(reader.i64("current version")?),
            },
            2 => ResponseBody::StreamDeleted,
            3 => ResponseBody::AccessDenied,
            value => {
                return Err(CodecError::InvalidValue {
                    field: "write outcome",
                    value: i64::from(value),
                });
            }
        },
        Command::BadRequest => ResponseBody::BadRequest {
            detail: reader.string("detail")?,
        },
        Command::NotHandled => {
            let reason = match reader.u8("not handled reason")? {
                0 => NotHandledReason::NotReady,
                1 => NotHandledReason::TooBusy,
                2 => {
                    let leader = match reader.u8("leader present")? {
                        0 => None,
                        _ => Some(reader.endpoint("leader")?),
                    };
                    NotHandledReason::NotLeader { leader }
                }
                value => {
                    return Err(CodecError::InvalidValue {
                        field: "not handled reason",
                        value: i64::from(value),
                    });
                }
            };
            ResponseBody::NotHandled(reason)
        }
        other => {
            return Err(CodecError::UnexpectedCommand {
                command: other as u8,
            });
        }
    };
    Ok(Response { correlation, body })
}

/// gossip 查询帧，负载为空。
pub fn gossip_query(correlation: CorrelationId) -> Frame {
    Frame::new(Command::GossipQuery, correlation, Bytes::new())
}

/// 成员表 → gossip 应答帧。
pub fn encode_gossip_reply(
    correlation: CorrelationId,
    members: &[ClusterMember],
) -> Result<Frame, CodecError> {
    let mut payload = BytesMut::new();
    let count = u16::try_from(members.len()).map_err(|_| CodecError::FieldTooLong {
        field: "members",
        length: members.len(),
    })?;
    payload.put_u16_le(count);
    for member in members {
        put_endpoint(&mut payload, "tcp endpoint", &member.tcp_endpoint)?;
        put_endpoint(&mut payload, "gossip endpoint", &member.gossip_endpoint)?;
        payload.put_u8(role_code(member.role));
        payload.put_u8(u8::from(member.is_alive));
        payload.put_i64_le(member.writer_checkpoint);
    }
    Ok(Frame::new(Command::GossipReply, correlation, payload.freeze()))
}

/// gossip 应答帧 → 成员表。
pub fn decode_gossip_reply(frame: Frame) -> Result<Vec<ClusterMember>, CodecError> {
    if frame.command != Command::GossipReply {
        return Err(CodecError::UnexpectedCommand {
            command: frame.command as u8,
        });
    }
    let mut reader = Reader::new(frame.payload);
    let count = reader.u16("member count")?;
    (0..count)
        .map(|_| -> Result<ClusterMember, CodecError> {
            Ok(ClusterMember {
                tcp_endpoint: reader.endpoint("tcp endpoint")?,
                gossip_endpoint: reader.endpoint("gossip endpoint")?,
                role: role_from_code(reader.u8("role")?),
                is_alive: reader.u8("alive")? != 0,
                writer_checkpoint: reader.i64("writer checkpoint")?,
            })
        })
        .collect()
}

#[derive(Clone, Copy)]
#[repr(u8)]
enum WriteOutcome {
    Success = 0,
    WrongExpectedVersion = 1,
    StreamDeleted = 2,
    AccessDenied = 3,
}

const ROLES: [NodeRole; 8] = [
    NodeRole::Leader,
    NodeRole::Follower,
    NodeRole::ReadOnlyReplica,
    NodeRole::Clone,
    NodeRole::CatchingUp,
    NodeRole::Manager,
    NodeRole::ShuttingDown,
    NodeRole::Unknown,
];

fn role_code(role: NodeRole) -> u8 {
    ROLES
        .iter()
        .position(|candidate| *candidate == role)
        .map_or(u8::MAX, |index| index as u8)
}

// 未来服务端新增的角色按 `Unknown` 处理，不会被选为建连目标。
fn role_from_code(code: u8) -> NodeRole {
    ROLES
        .get(usize::from(code))
        .copied()
        .unwrap_or(NodeRole::Unknown)
}

fn encode_append(append: &AppendRequest, dst: &mut BytesMut) -> Result<(), CodecError> {
    put_string(dst, "stream", &append.stream)?;
    dst.put_i64_le(append.expected_version.to_wire());
    dst.put_u8(u8::from(append.require_leader));
    let count = u16::try_from(append.events.len()).map_err(|_| CodecError::FieldTooLong {
        field: "events",
        length: append.events.len(),
    })?;
    dst.put_u16_le(count);
    for event in &append.events {
        dst.put_slice(event.event_id.as_bytes());
        put_string(dst, "event type", &event.event_type)?;
        dst.put_u8(u8::from(event.is_json));
        put_blob(dst, "data", &event.data)?;
        put_blob(dst, "metadata", &event.metadata)?;
    }
    Ok(())
}

fn decode_append(
    reader: &mut Reader,
    credentials: Option<UserCredentials>,
) -> Result<AppendRequest, CodecError> {
    let stream = reader.string("stream")?;
    let raw_expected = reader.i64("expected version")?;
    let expected_version =
        ExpectedVersion::from_wire(raw_expected).ok_or(CodecError::InvalidValue {
            field: "expected version",
            value: raw_expected,
        })?;
    let require_leader = reader.u8("require leader")? != 0;
    let count = reader.u16("event count")?;
    let mut events = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        events.push(EventData {
            event_id: reader.uuid("event id")?,
            event_type: reader.string("event type")?,
            is_json: reader.u8("is json")? != 0,
            data: reader.blob("data")?,
            metadata: reader.blob("metadata")?,
        });
    }
    Ok(AppendRequest {
        stream,
        expected_version,
        events,
        require_leader,
        credentials,
    })
}

fn put_string(dst: &mut BytesMut, field: &'static str, value: &str) -> Result<(), CodecError> {
    let length = u16::try_from(value.len()).map_err(|_| CodecError::FieldTooLong {
        field,
        length: value.len(),
    })?;
    dst.put_u16_le(length);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn put_blob(dst: &mut BytesMut, field: &'static str, value: &[u8]) -> Result<(), CodecError> {
    let length = u32::try_from(value.len()).map_err(|_| CodecError::FieldTooLong {
        field,
        length: value.len(),
    })?;
    dst.put_u32_le(length);
    dst.put_slice(value);
    Ok(())
}

fn put_endpoint(
    dst: &mut BytesMut,
    field: &'static str,
    endpoint: &Endpoint,
) -> Result<(), CodecError> {
    put_string(dst, field, &endpoint.host)?;
    dst.put_u16_le(endpoint.port);
    Ok(())
}

/// 带边界检查的负载读取器；`Bytes` 自带的 `get_*` 在越界时会 panic。
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn ensure(&self, field: &'static str, len: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < len {
            return Err(CodecError::Truncated { field });
        }
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        self.ensure(field, 1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, CodecError> {
        self.ensure(field, 2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, CodecError> {
        self.ensure(field, 8)?;
        Ok(self.buf.get_u64_le())
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, CodecError> {
        self.ensure(field, 8)?;
        Ok(self.buf.get_i64_le())
    }

    fn bytes(&mut self, field: &'static str, len: usize) -> Result<Bytes, CodecError> {
        self.ensure(field, len)?;
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self, field: &'static str) -> Result<String, CodecError> {
        let len = usize::from(self.u16(field)?);
        let raw = self.bytes(field, len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8 { field })
    }

    fn blob(&mut self, field: &'static str) -> Result<Bytes, CodecError> {
        self.ensure(field, 4)?;
        let len = self.buf.get_u32_le() as usize;
        self.bytes(field, len)
    }

    fn uuid(&mut self, field: &'static str) -> Result<Uuid, CodecError> {
        let raw = self.bytes(field, 16)?;
        Uuid::from_slice(&raw).map_err(|_| CodecError::Truncated { field })
    }

    fn endpoint(&mut self, field: &'static str) -> Result<Endpoint, CodecError> {
        let host = self.string(field)?;
        let port = self.u16(field)?;
        Ok(Endpoint::new(host, port))
    }
}
