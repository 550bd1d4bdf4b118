//! 服务端分发
//!
//! `Server` 保存方法到处理器的映射以及两条服务端拦截链。处理器是业务逻辑，
//! 分发拦截器包在它外面，能看到方法标识和最终的错误/状态。

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use relay_errors::{RpcError, RpcResult};
use tracing::debug;

use crate::context::CallContext;
use crate::message::{AnyMessage, Message};
use crate::method::{MethodName, StreamDesc};
use crate::record::{CallKind, CallSide, InvocationTimer};
use crate::sink::CallSink;
use crate::stream::{BoxServerStream, ObservedStream, ServerStream, TypedServerStream};

/// 一元业务处理器
#[async_trait]
pub trait UnaryHandler: Send + Sync {
    async fn call(&self, ctx: CallContext, request: AnyMessage) -> RpcResult<AnyMessage>;
}

/// 流式业务处理器
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn call(&self, stream: BoxServerStream) -> RpcResult<()>;
}

/// 类型化一元处理器适配器，见 [`unary_fn`]
pub struct UnaryFn<Req, Resp, F> {
    f: F,
    _marker: PhantomData<fn(Req) -> Resp>,
}

/// 用具体请求/响应类型的异步函数创建一元处理器
pub fn unary_fn<Req, Resp, F, Fut>(f: F) -> UnaryFn<Req, Resp, F>
where
    Req: Message,
    Resp: Message,
    F: Fn(CallContext, Req) -> Fut + Send + Sync,
    Fut: Future<Output = RpcResult<Resp>> + Send + 'static,
{
    UnaryFn {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<Req, Resp, F, Fut> UnaryHandler for UnaryFn<Req, Resp, F>
where
    Req: Message,
    Resp: Message,
    F: Fn(CallContext, Req) -> Fut + Send + Sync,
    Fut: Future<Output = RpcResult<Resp>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, request: AnyMessage) -> RpcResult<AnyMessage> {
        let request = request.downcast::<Req>()?;
        let response = (self.f)(ctx, request).await?;
        Ok(AnyMessage::new(response))
    }
}

/// 类型化流处理器适配器，见 [`stream_fn`]
pub struct StreamFn<Req, Resp, F> {
    f: F,
    _marker: PhantomData<fn(Req) -> Resp>,
}

pub fn stream_fn<Req, Resp, F, Fut>(f: F) -> StreamFn<Req, Resp, F>
where
    Req: Message,
    Resp: Message,
    F: Fn(TypedServerStream<Req, Resp>) -> Fut + Send + Sync,
    Fut: Future<Output = RpcResult<()>> + Send + 'static,
{
    StreamFn {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<Req, Resp, F, Fut> StreamHandler for StreamFn<Req, Resp, F>
where
    Req: Message,
    Resp: Message,
    F: Fn(TypedServerStream<Req, Resp>) -> Fut + Send + Sync,
    Fut: Future<Output = RpcResult<()>> + Send + 'static,
{
    async fn call(&self, stream: BoxServerStream) -> RpcResult<()> {
        (self.f)(TypedServerStream::new(stream)).await
    }
}

/// 一元调用的服务端信息
#[derive(Debug, Clone)]
pub struct UnaryServerInfo {
    pub full_method: MethodName,
}

/// 流调用的服务端信息
#[derive(Debug, Clone)]
pub struct StreamServerInfo {
    pub full_method: MethodName,
    pub desc: StreamDesc,
}

/// 服务端一元拦截器
#[async_trait]
pub trait ServerUnaryInterceptor: Send + Sync {
    async fn intercept(
        &self,
        ctx: CallContext,
        request: AnyMessage,
        info: &UnaryServerInfo,
        handler: ServerUnaryNext<'_>,
    ) -> RpcResult<AnyMessage>;
}

pub struct ServerUnaryNext<'a> {
    interceptors: &'a [Arc<dyn ServerUnaryInterceptor>],
    info: &'a UnaryServerInfo,
    handler: &'a dyn UnaryHandler,
}

impl<'a> ServerUnaryNext<'a> {
    pub fn new(
        interceptors: &'a [Arc<dyn ServerUnaryInterceptor>],
        info: &'a UnaryServerInfo,
        handler: &'a dyn UnaryHandler,
    ) -> Self {
        Self {
            interceptors,
            info,
            handler,
        }
    }

    pub async fn run(self, ctx: CallContext, request: AnyMessage) -> RpcResult<AnyMessage> {
        match self.interceptors.split_first() {
            Some((first, rest)) => {
                let next = ServerUnaryNext {
                    interceptors: rest,
                    info: self.info,
                    handler: self.handler,
                };
                first.intercept(ctx, request, self.info, next).await
            }
            None => {
                // 处理器在取消和截止时间约束内执行，外层拦截器照常拿到结果
                let guard = ctx.clone();
                guard.guard(self.handler.call(ctx, request)).await
            }
        }
    }
}

/// 服务端流拦截器
#[async_trait]
pub trait ServerStreamInterceptor: Send + Sync {
    async fn intercept(
        &self,
        stream: BoxServerStream,
        info: &StreamServerInfo,
        handler: ServerStreamNext<'_>,
    ) -> RpcResult<()>;
}

pub struct ServerStreamNext<'a> {
    interceptors: &'a [Arc<dyn ServerStreamInterceptor>],
    info: &'a StreamServerInfo,
    handler: &'a dyn StreamHandler,
}

impl<'a> ServerStreamNext<'a> {
    pub fn new(
        interceptors: &'a [Arc<dyn ServerStreamInterceptor>],
        info: &'a StreamServerInfo,
        handler: &'a dyn StreamHandler,
    ) -> Self {
        Self {
            interceptors,
            info,
            handler,
        }
    }

    pub async fn run(self, stream: BoxServerStream) -> RpcResult<()> {
        match self.interceptors.split_first() {
            Some((first, rest)) => {
                let next = ServerStreamNext {
                    interceptors: rest,
                    info: self.info,
                    handler: self.handler,
                };
                first.intercept(stream, self.info, next).await
            }
            None => self.handler.call(stream).await,
        }
    }
}

/// 分发日志拦截器
///
/// 只观察不修改：记录方法、耗时，出错时记录从错误中提取的状态码和消息。
#[derive(Clone)]
pub struct DispatchLoggingInterceptor {
    sink: Arc<dyn CallSink>,
}

impl DispatchLoggingInterceptor {
    pub fn new(sink: Arc<dyn CallSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl ServerUnaryInterceptor for DispatchLoggingInterceptor {
    async fn intercept(
        &self,
        ctx: CallContext,
        request: AnyMessage,
        info: &UnaryServerInfo,
        handler: ServerUnaryNext<'_>,
    ) -> RpcResult<AnyMessage> {
        let timer = InvocationTimer::start(info.full_method.clone(), CallSide::Server, CallKind::Unary);
        let result = handler.run(ctx, request).await;
        self.sink.record_call(&timer.finish(&result));
        result
    }
}

#[async_trait]
impl ServerStreamInterceptor for DispatchLoggingInterceptor {
    async fn intercept(
        &self,
        stream: BoxServerStream,
        info: &StreamServerInfo,
        handler: ServerStreamNext<'_>,
    ) -> RpcResult<()> {
        let timer = InvocationTimer::start(info.full_method.clone(), CallSide::Server, CallKind::Stream);
        let result = handler.run(stream).await;
        self.sink.record_call(&timer.finish(&result));
        result
    }
}

/// 服务端流观察拦截器：处理器看到的是包装后的流
#[derive(Clone)]
pub struct ObservingServerStreamInterceptor {
    sink: Arc<dyn CallSink>,
}

impl ObservingServerStreamInterceptor {
    pub fn new(sink: Arc<dyn CallSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl ServerStreamInterceptor for ObservingServerStreamInterceptor {
    async fn intercept(
        &self,
        stream: BoxServerStream,
        _info: &StreamServerInfo,
        handler: ServerStreamNext<'_>,
    ) -> RpcResult<()> {
        let observed = ObservedStream::server(stream, self.sink.clone());
        handler.run(Box::new(observed)).await
    }
}

struct Unimplemented;

#[async_trait]
impl UnaryHandler for Unimplemented {
    async fn call(&self, _ctx: CallContext, _request: AnyMessage) -> RpcResult<AnyMessage> {
        Err(RpcError::unimplemented("method not found"))
    }
}

#[async_trait]
impl StreamHandler for Unimplemented {
    async fn call(&self, _stream: BoxServerStream) -> RpcResult<()> {
        Err(RpcError::unimplemented("method not found"))
    }
}

struct StreamRoute {
    desc: StreamDesc,
    handler: Arc<dyn StreamHandler>,
}

/// 方法注册表 + 服务端拦截链
pub struct Server {
    unary: HashMap<MethodName, Arc<dyn UnaryHandler>>,
    streams: HashMap<MethodName, StreamRoute>,
    unary_interceptors: Vec<Arc<dyn ServerUnaryInterceptor>>,
    stream_interceptors: Vec<Arc<dyn ServerStreamInterceptor>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("unary_methods", &self.unary.keys().collect::<Vec<_>>())
            .field("stream_methods", &self.streams.keys().collect::<Vec<_>>())
            .field("unary_interceptors", &self.unary_interceptors.len())
            .field("stream_interceptors", &self.stream_interceptors.len())
            .finish()
    }
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    pub fn has_unary(&self, method: &str) -> bool {
        self.unary.contains_key(method)
    }

    pub fn stream_desc(&self, method: &str) -> Option<&StreamDesc> {
        self.streams.get(method).map(|route| &route.desc)
    }

    /// 经过服务端一元拦截链调用处理器；未注册的方法返回 `Unimplemented`
    pub async fn dispatch_unary(
        &self,
        ctx: CallContext,
        method: &MethodName,
        request: AnyMessage,
    ) -> RpcResult<AnyMessage> {
        let info = UnaryServerInfo {
            full_method: method.clone(),
        };
        let handler: &dyn UnaryHandler = match self.unary.get(method) {
            Some(handler) => handler.as_ref(),
            None => {
                debug!(method = %method, "Unknown unary method");
                &Unimplemented
            }
        };
        ServerUnaryNext::new(&self.unary_interceptors, &info, handler)
            .run(ctx, request)
            .await
    }

    /// 经过服务端流拦截链调用处理器
    pub async fn dispatch_stream(&self, stream: BoxServerStream) -> RpcResult<()> {
        let method = stream.method().clone();
        let (desc, handler): (StreamDesc, &dyn StreamHandler) = match self.streams.get(&method) {
            Some(route) => (route.desc.clone(), route.handler.as_ref()),
            None => {
                debug!(method = %method, "Unknown stream method");
                (StreamDesc::bidirectional(method.method()), &Unimplemented)
            }
        };
        let info = StreamServerInfo {
            full_method: method,
            desc,
        };
        ServerStreamNext::new(&self.stream_interceptors, &info, handler)
            .run(stream)
            .await
    }
}

#[derive(Default)]
pub struct ServerBuilder {
    unary: HashMap<MethodName, Arc<dyn UnaryHandler>>,
    streams: HashMap<MethodName, StreamRoute>,
    unary_interceptors: Vec<Arc<dyn ServerUnaryInterceptor>>,
    stream_interceptors: Vec<Arc<dyn ServerStreamInterceptor>>,
}

impl ServerBuilder {
    /// 追加一元拦截器；先追加的在外层
    #[must_use]
    pub fn unary_interceptor<I>(mut self, interceptor: I) -> Self
    where
        I: ServerUnaryInterceptor + 'static,
    {
        self.unary_interceptors.push(Arc::new(interceptor));
        self
    }

    #[must_use]
    pub fn stream_interceptor<I>(mut self, interceptor: I) -> Self
    where
        I: ServerStreamInterceptor + 'static,
    {
        self.stream_interceptors.push(Arc::new(interceptor));
        self
    }

    #[must_use]
    pub fn unary<H>(mut self, method: impl Into<MethodName>, handler: H) -> Self
    where
        H: UnaryHandler + 'static,
    {
        self.unary.insert(method.into(), Arc::new(handler));
        self
    }

    #[must_use]
    pub fn stream<H>(mut self, method: impl Into<MethodName>, desc: StreamDesc, handler: H) -> Self
    where
        H: StreamHandler + 'static,
    {
        self.streams.insert(
            method.into(),
            StreamRoute {
                desc,
                handler: Arc::new(handler),
            },
        );
        self
    }

    pub fn build(self) -> Server {
        Server {
            unary: self.unary,
            streams: self.streams,
            unary_interceptors: self.unary_interceptors,
            stream_interceptors: self.stream_interceptors,
        }
    }
}
