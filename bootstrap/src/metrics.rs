//! Metrics 模块
//!
//! 把调用记录转换为 Prometheus 指标

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusHandle};
use relay_interceptor::{CallSink, InvocationRecord, MessageEvent};

/// Metrics 记录器
pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    /// 安装全局 Prometheus recorder
    pub fn install() -> Result<Self, BuildError> {
        let handle = relay_telemetry::init_metrics()?;
        Ok(Self { handle })
    }

    pub fn from_handle(handle: PrometheusHandle) -> Self {
        Self { handle }
    }

    /// 获取 Prometheus 格式的 metrics
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// 记录一次 RPC 调用
pub fn record_rpc_call(service: &str, method: &str, side: &str, code: &str, duration_ms: f64) {
    let labels = [
        ("service", service.to_string()),
        ("method", method.to_string()),
        ("side", side.to_string()),
        ("code", code.to_string()),
    ];

    counter!("rpc_calls_total", &labels).increment(1);
    histogram!("rpc_call_duration_ms", &labels).record(duration_ms);
}

/// 记录一条流消息
pub fn record_stream_message(method: &str, direction: &str) {
    let labels = [
        ("method", method.to_string()),
        ("direction", direction.to_string()),
    ];

    counter!("rpc_stream_messages_total", &labels).increment(1);
}

/// 写入 `metrics` 门面的 sink
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSink;

impl MetricsSink {
    pub fn new() -> Self {
        Self
    }
}

impl CallSink for MetricsSink {
    fn record_call(&self, record: &InvocationRecord<'_>) {
        record_rpc_call(
            record.method.service(),
            record.method.method(),
            record.side.as_str(),
            record.status.code_name(),
            record.elapsed_ms(),
        );
    }

    fn record_message(&self, event: &MessageEvent) {
        record_stream_message(event.method.as_str(), event.direction.as_str());
    }
}
