//! 一元调用拦截链
//!
//! 拦截器按注册顺序进入、按相反顺序退出（洋葱模型）。每个拦截器拿到一个
//! [`UnaryNext`]，调用 `run` 即进入下一层；不调用就是短路。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_errors::RpcResult;
use tonic::metadata::{AsciiMetadataValue, MetadataMap};
use tracing::{Instrument, debug, info_span};
use uuid::Uuid;

use crate::context::CallContext;
use crate::message::AnyMessage;
use crate::method::MethodName;
use crate::record::{CallKind, CallSide, InvocationTimer};
use crate::sink::CallSink;

/// 终端调用：客户端是传输层调用，也可以是另一条链
#[async_trait]
pub trait UnaryInvoker: Send + Sync {
    async fn invoke(
        &self,
        ctx: CallContext,
        method: &MethodName,
        request: AnyMessage,
    ) -> RpcResult<AnyMessage>;
}

/// 用异步闭包实现的终端调用
pub struct FnInvoker<F> {
    f: F,
}

impl<F, Fut> FnInvoker<F>
where
    F: Fn(CallContext, MethodName, AnyMessage) -> Fut + Send + Sync,
    Fut: Future<Output = RpcResult<AnyMessage>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> std::fmt::Debug for FnInvoker<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnInvoker").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> UnaryInvoker for FnInvoker<F>
where
    F: Fn(CallContext, MethodName, AnyMessage) -> Fut + Send + Sync,
    Fut: Future<Output = RpcResult<AnyMessage>> + Send + 'static,
{
    async fn invoke(
        &self,
        ctx: CallContext,
        method: &MethodName,
        request: AnyMessage,
    ) -> RpcResult<AnyMessage> {
        (self.f)(ctx, method.clone(), request).await
    }
}

/// 一元拦截器
#[async_trait]
pub trait UnaryInterceptor: Send + Sync {
    async fn intercept(
        &self,
        ctx: CallContext,
        method: &MethodName,
        request: AnyMessage,
        next: UnaryNext<'_>,
    ) -> RpcResult<AnyMessage>;
}

/// 剩余拦截器加终端调用组成的续体
pub struct UnaryNext<'a> {
    interceptors: &'a [Arc<dyn UnaryInterceptor>],
    terminal: &'a dyn UnaryInvoker,
}

impl<'a> UnaryNext<'a> {
    pub fn new(interceptors: &'a [Arc<dyn UnaryInterceptor>], terminal: &'a dyn UnaryInvoker) -> Self {
        Self {
            interceptors,
            terminal,
        }
    }

    /// 进入下一层；消耗自身，所以每个拦截器最多调用一次
    pub async fn run(
        self,
        ctx: CallContext,
        method: &MethodName,
        request: AnyMessage,
    ) -> RpcResult<AnyMessage> {
        match self.interceptors.split_first() {
            Some((first, rest)) => {
                let next = UnaryNext {
                    interceptors: rest,
                    terminal: self.terminal,
                };
                first.intercept(ctx, method, request, next).await
            }
            None => self.terminal.invoke(ctx, method, request).await,
        }
    }
}

/// 有序拦截器 + 终端调用
#[derive(Clone)]
pub struct UnaryChain {
    interceptors: Vec<Arc<dyn UnaryInterceptor>>,
    terminal: Arc<dyn UnaryInvoker>,
}

impl std::fmt::Debug for UnaryChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnaryChain")
            .field("interceptors", &self.interceptors.len())
            .finish_non_exhaustive()
    }
}

impl UnaryChain {
    pub fn new(terminal: Arc<dyn UnaryInvoker>) -> Self {
        Self {
            interceptors: Vec::new(),
            terminal,
        }
    }

    pub fn from_parts(
        interceptors: Vec<Arc<dyn UnaryInterceptor>>,
        terminal: Arc<dyn UnaryInvoker>,
    ) -> Self {
        Self {
            interceptors,
            terminal,
        }
    }

    /// 追加拦截器；先追加的在外层
    #[must_use]
    pub fn with<I>(mut self, interceptor: I) -> Self
    where
        I: UnaryInterceptor + 'static,
    {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    fn next(&self) -> UnaryNext<'_> {
        UnaryNext::new(&self.interceptors, self.terminal.as_ref())
    }
}

#[async_trait]
impl UnaryInvoker for UnaryChain {
    async fn invoke(
        &self,
        ctx: CallContext,
        method: &MethodName,
        request: AnyMessage,
    ) -> RpcResult<AnyMessage> {
        self.next().run(ctx, method, request).await
    }
}

/// 计时拦截器
///
/// 紧挨着 next 前后取时间，无论成功失败都交给 sink，然后原样返回结果。
#[derive(Clone)]
pub struct TimingInterceptor {
    sink: Arc<dyn CallSink>,
}

impl TimingInterceptor {
    pub fn new(sink: Arc<dyn CallSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl UnaryInterceptor for TimingInterceptor {
    async fn intercept(
        &self,
        ctx: CallContext,
        method: &MethodName,
        request: AnyMessage,
        next: UnaryNext<'_>,
    ) -> RpcResult<AnyMessage> {
        let timer = InvocationTimer::start(method.clone(), CallSide::Client, CallKind::Unary);
        let result = next.run(ctx, method, request).await;
        self.sink.record_call(&timer.finish(&result));
        result
    }
}

pub const TRACE_ID_HEADER: &str = "x-trace-id";
const FALLBACK_TRACE_HEADERS: [&str; 2] = ["x-request-id", "x-correlation-id"];

/// 确保元数据里有 `x-trace-id`，返回最终使用的值
pub fn ensure_trace_id(metadata: &mut MetadataMap) -> String {
    if let Some(id) = metadata.get(TRACE_ID_HEADER).and_then(|v| v.to_str().ok()) {
        return id.to_string();
    }

    let id = FALLBACK_TRACE_HEADERS
        .iter()
        .find_map(|key| metadata.get(*key).and_then(|v| v.to_str().ok()))
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    if let Ok(value) = AsciiMetadataValue::try_from(id.as_str()) {
        metadata.insert(TRACE_ID_HEADER, value);
    }
    id
}

/// 追踪 ID 拦截器：补齐 `x-trace-id`，并在带 trace_id 的 span 中执行后续链路
#[derive(Debug, Clone, Default)]
pub struct TraceIdInterceptor;

impl TraceIdInterceptor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl UnaryInterceptor for TraceIdInterceptor {
    async fn intercept(
        &self,
        mut ctx: CallContext,
        method: &MethodName,
        request: AnyMessage,
        next: UnaryNext<'_>,
    ) -> RpcResult<AnyMessage> {
        let trace_id = ensure_trace_id(ctx.metadata_mut());
        let span = info_span!("rpc_call", method = %method, trace_id = %trace_id);
        next.run(ctx, method, request).instrument(span).await
    }
}

/// 默认超时拦截器：上下文没有截止时间时补上配置的超时
///
/// 只设置截止时间，由终端调用负责执行。
#[derive(Debug, Clone)]
pub struct DeadlineInterceptor {
    timeout: Duration,
}

impl DeadlineInterceptor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl UnaryInterceptor for DeadlineInterceptor {
    async fn intercept(
        &self,
        ctx: CallContext,
        method: &MethodName,
        request: AnyMessage,
        next: UnaryNext<'_>,
    ) -> RpcResult<AnyMessage> {
        let ctx = match ctx.deadline() {
            Some(_) => ctx,
            None => {
                debug!(method = %method, timeout = ?self.timeout, "Applying default timeout");
                ctx.with_timeout(self.timeout)
            }
        };
        next.run(ctx, method, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use relay_errors::RpcError;

    fn echo() -> Arc<dyn UnaryInvoker> {
        Arc::new(FnInvoker::new(|_ctx, _method, request| async move { Ok(request) }))
    }

    #[test]
    fn test_ensure_trace_id_keeps_existing() {
        let mut md = MetadataMap::new();
        md.insert(TRACE_ID_HEADER, AsciiMetadataValue::from_static("abc"));
        assert_eq!(ensure_trace_id(&mut md), "abc");
    }

    #[test]
    fn test_ensure_trace_id_adopts_request_id() {
        let mut md = MetadataMap::new();
        md.insert("x-request-id", AsciiMetadataValue::from_static("req-1"));
        assert_eq!(ensure_trace_id(&mut md), "req-1");
        assert_eq!(md.get(TRACE_ID_HEADER).unwrap().to_str().unwrap(), "req-1");
    }

    #[test]
    fn test_ensure_trace_id_generates() {
        let mut md = MetadataMap::new();
        let id = ensure_trace_id(&mut md);
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(md.get(TRACE_ID_HEADER).unwrap().to_str().unwrap(), id);
    }

    #[tokio::test]
    async fn test_empty_chain_calls_terminal() {
        let chain = UnaryChain::new(echo());
        assert!(chain.is_empty());
        let resp = chain
            .invoke(CallContext::new(), &"/a/b".into(), AnyMessage::new(5u32))
            .await
            .unwrap();
        assert_eq!(resp.downcast::<u32>().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_deadline_interceptor_keeps_existing_deadline() {
        let terminal = Arc::new(FnInvoker::new(|ctx: CallContext, _method, _request| async move {
            Ok(AnyMessage::new(ctx.remaining()))
        }));
        let chain = UnaryChain::new(terminal).with(DeadlineInterceptor::new(Duration::from_secs(30)));

        let resp = chain
            .invoke(CallContext::new(), &"/a/b".into(), AnyMessage::new(()))
            .await
            .unwrap();
        let remaining = resp.downcast::<Option<Duration>>().unwrap().unwrap();
        assert!(remaining > Duration::from_secs(29));

        let ctx = CallContext::new().with_timeout(Duration::from_secs(1));
        let resp = chain
            .invoke(ctx, &"/a/b".into(), AnyMessage::new(()))
            .await
            .unwrap();
        let remaining = resp.downcast::<Option<Duration>>().unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_trace_id_interceptor_keeps_caller_id() {
        let terminal = Arc::new(FnInvoker::new(|ctx: CallContext, _method, _request| async move {
            let id = ctx
                .metadata()
                .get(TRACE_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            Ok(AnyMessage::new(id))
        }));
        let chain = UnaryChain::new(terminal).with(TraceIdInterceptor);

        let mut md = MetadataMap::new();
        md.insert("x-correlation-id", AsciiMetadataValue::from_static("corr-9"));
        let resp = chain
            .invoke(CallContext::new().with_metadata(md), &"/a/b".into(), AnyMessage::new(()))
            .await
            .unwrap();
        assert_eq!(resp.downcast::<Option<String>>().unwrap().as_deref(), Some("corr-9"));
    }

    #[tokio::test]
    async fn test_timing_records_error_path() {
        let sink = Arc::new(MemorySink::new());
        let terminal = Arc::new(FnInvoker::new(|_ctx, _method, _request| async move {
            Err(RpcError::unavailable("backend down"))
        }));
        let chain = UnaryChain::new(terminal).with(TimingInterceptor::new(sink.clone()));

        let err = chain
            .invoke(CallContext::new(), &"/svc/Call".into(), AnyMessage::new(()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);

        let calls = sink.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].side, CallSide::Client);
        assert_eq!(calls[0].status.code, tonic::Code::Unavailable);
    }
}
