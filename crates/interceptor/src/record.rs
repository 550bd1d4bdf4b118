//! 调用记录与消息事件

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_errors::{RpcError, StatusInfo};
use tokio::time::Instant;

use crate::method::MethodName;

/// 调用所在的一侧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSide {
    Client,
    Server,
}

impl CallSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

impl fmt::Display for CallSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    Stream,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unary => "unary",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次调用的完整记录
///
/// 在调用 next 之前由 [`InvocationTimer`] 创建，返回后立即定型，交给 sink 后丢弃。
/// `error` 借用的就是要向上返回的那个错误实例。
#[derive(Debug)]
pub struct InvocationRecord<'a> {
    pub method: MethodName,
    pub side: CallSide,
    pub kind: CallKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub error: Option<&'a RpcError>,
    pub status: StatusInfo,
}

impl InvocationRecord<'_> {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

/// 调用计时器
pub struct InvocationTimer {
    method: MethodName,
    side: CallSide,
    kind: CallKind,
    started_at: DateTime<Utc>,
    start: Instant,
}

impl InvocationTimer {
    pub fn start(method: MethodName, side: CallSide, kind: CallKind) -> Self {
        Self {
            method,
            side,
            kind,
            started_at: Utc::now(),
            start: Instant::now(),
        }
    }

    pub fn finish<'a, T>(self, result: &'a Result<T, RpcError>) -> InvocationRecord<'a> {
        let elapsed = self.start.elapsed();
        let finished_at = Utc::now();
        let error = result.as_ref().err();
        InvocationRecord {
            status: StatusInfo::from_result(result),
            method: self.method,
            side: self.side,
            kind: self.kind,
            started_at: self.started_at,
            finished_at,
            elapsed,
            error,
        }
    }
}

/// 消息方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Receive => "receive",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 流上一条消息的观察记录
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub method: MethodName,
    pub side: CallSide,
    pub direction: Direction,
    pub message_type: &'static str,
    pub at: DateTime<Utc>,
}

impl MessageEvent {
    pub fn now(
        method: MethodName,
        side: CallSide,
        direction: Direction,
        message_type: &'static str,
    ) -> Self {
        Self {
            method,
            side,
            direction,
            message_type,
            at: Utc::now(),
        }
    }
}
