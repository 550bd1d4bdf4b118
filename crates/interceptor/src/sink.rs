//! 日志/计时 sink
//!
//! 拦截器只负责产生记录，怎么落地由 sink 决定。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use relay_errors::StatusInfo;
use tracing::{debug, info, warn};

use crate::method::MethodName;
use crate::record::{CallKind, CallSide, Direction, InvocationRecord, MessageEvent};

/// 调用记录的消费者
pub trait CallSink: Send + Sync {
    fn record_call(&self, record: &InvocationRecord<'_>);

    fn record_message(&self, event: &MessageEvent) {
        let _ = event;
    }
}

/// 输出结构化 tracing 事件
#[derive(Debug, Clone, Default)]
pub struct TracingSink {
    verbose_messages: bool,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 流消息以 info 级别输出，默认是 debug
    pub fn with_verbose_messages(mut self, enabled: bool) -> Self {
        self.verbose_messages = enabled;
        self
    }
}

fn rfc3339(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl CallSink for TracingSink {
    fn record_call(&self, record: &InvocationRecord<'_>) {
        match record.error {
            None => info!(
                method = %record.method,
                side = %record.side,
                kind = %record.kind,
                start = %rfc3339(&record.started_at),
                end = %rfc3339(&record.finished_at),
                duration_ms = record.elapsed_ms(),
                "RPC completed"
            ),
            Some(err) => warn!(
                method = %record.method,
                side = %record.side,
                kind = %record.kind,
                start = %rfc3339(&record.started_at),
                end = %rfc3339(&record.finished_at),
                duration_ms = record.elapsed_ms(),
                code = record.status.code_name(),
                status_message = %record.status.message,
                error = %err,
                "RPC failed"
            ),
        }
    }

    fn record_message(&self, event: &MessageEvent) {
        if self.verbose_messages {
            info!(
                method = %event.method,
                side = %event.side,
                direction = %event.direction,
                message_type = event.message_type,
                at = %rfc3339(&event.at),
                "Stream message"
            );
        } else {
            debug!(
                method = %event.method,
                side = %event.side,
                direction = %event.direction,
                message_type = event.message_type,
                at = %rfc3339(&event.at),
                "Stream message"
            );
        }
    }
}

/// 按顺序转发给多个 sink
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn CallSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn CallSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }
}

impl std::fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl CallSink for FanoutSink {
    fn record_call(&self, record: &InvocationRecord<'_>) {
        for sink in &self.sinks {
            sink.record_call(record);
        }
    }

    fn record_message(&self, event: &MessageEvent) {
        for sink in &self.sinks {
            sink.record_message(event);
        }
    }
}

/// 内存中保留的调用记录
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: MethodName,
    pub side: CallSide,
    pub kind: CallKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub status: StatusInfo,
    /// 错误的 Display 文本
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    calls: Vec<RecordedCall>,
    messages: Vec<MessageEvent>,
}

/// 把记录保存在内存里，供测试断言
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    pub fn messages(&self) -> Vec<MessageEvent> {
        self.state().messages.clone()
    }

    /// 某个方向上观察到的消息类型名，按观察顺序
    pub fn message_types(&self, direction: Direction) -> Vec<&'static str> {
        self.state()
            .messages
            .iter()
            .filter(|event| event.direction == direction)
            .map(|event| event.message_type)
            .collect()
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.calls.clear();
        state.messages.clear();
    }
}

impl CallSink for MemorySink {
    fn record_call(&self, record: &InvocationRecord<'_>) {
        self.state().calls.push(RecordedCall {
            method: record.method.clone(),
            side: record.side,
            kind: record.kind,
            started_at: record.started_at,
            finished_at: record.finished_at,
            elapsed: record.elapsed,
            status: record.status.clone(),
            error: record.error.map(|err| err.to_string()),
        });
    }

    fn record_message(&self, event: &MessageEvent) {
        self.state().messages.push(event.clone());
    }
}
