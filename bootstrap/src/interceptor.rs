//! 标准拦截链组装
//!
//! 客户端从外到内：默认超时、追踪 ID、计时；服务端：分发日志，
//! 按配置再加一层流观察。

use std::sync::Arc;

use relay_config::AppConfig;
use relay_interceptor::{
    CallSink, Channel, ChannelBuilder, DispatchLoggingInterceptor, FanoutSink, LoopbackTransport,
    ObservingServerStreamInterceptor, ObservingStreamInterceptor, Server, ServerBuilder,
    TimingInterceptor, TraceIdInterceptor, TracingSink, Transport,
};
use tracing::debug;

use crate::metrics::MetricsSink;

/// 按配置组合日志和指标 sink
pub fn pipeline_sink(config: &AppConfig) -> Arc<dyn CallSink> {
    let tracing_sink = TracingSink::new().with_verbose_messages(config.is_development());
    let mut fanout = FanoutSink::new().with(Arc::new(tracing_sink));
    if config.telemetry.metrics_enabled {
        fanout = fanout.with(Arc::new(MetricsSink::new()));
    }
    Arc::new(fanout)
}

/// 带标准客户端拦截器的通道构建器，调用方还可以继续追加
pub fn client_channel<T>(config: &AppConfig, transport: T, sink: Arc<dyn CallSink>) -> ChannelBuilder
where
    T: Transport + 'static,
{
    let client = &config.client;
    let mut builder = Channel::builder(transport).default_timeout(client.default_timeout());

    if client.propagate_trace_id {
        builder = builder.unary_interceptor(TraceIdInterceptor::new());
    }
    if client.log_unary {
        builder = builder.unary_interceptor(TimingInterceptor::new(sink.clone()));
    }
    if client.observe_stream_messages {
        builder = builder.stream_interceptor(ObservingStreamInterceptor::new(sink));
    }

    debug!(
        default_timeout_ms = client.default_timeout_ms,
        trace_id = client.propagate_trace_id,
        log_unary = client.log_unary,
        observe_streams = client.observe_stream_messages,
        "Client channel configured"
    );
    builder
}

/// 带标准服务端拦截器的服务构建器，处理器由调用方注册
pub fn server_builder(config: &AppConfig, sink: Arc<dyn CallSink>) -> ServerBuilder {
    let server = &config.server;
    let mut builder = Server::builder();

    if server.log_unary {
        builder = builder.unary_interceptor(DispatchLoggingInterceptor::new(sink.clone()));
    }
    if server.log_streams {
        builder = builder.stream_interceptor(DispatchLoggingInterceptor::new(sink.clone()));
    }
    if server.observe_stream_messages {
        builder = builder.stream_interceptor(ObservingServerStreamInterceptor::new(sink));
    }

    debug!(
        log_unary = server.log_unary,
        log_streams = server.log_streams,
        observe_streams = server.observe_stream_messages,
        "Server interceptors configured"
    );
    builder
}

/// 连到同进程服务的回环传输
pub fn loopback_transport(config: &AppConfig, server: Arc<Server>) -> LoopbackTransport {
    LoopbackTransport::new(server).with_buffer(config.server.stream_buffer)
}
