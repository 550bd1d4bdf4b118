//! 双向流包装与流拦截器
//!
//! `ObservedStream` 持有唯一一个底层流，对 `send` / `recv` 产生观察事件后原样
//! 转发，其余能力（上下文、头部、尾部、关闭）直接委托。流结束用 `Ok(None)`
//! 表示，包装层不会把它改成别的错误。

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use relay_errors::RpcResult;
use tonic::metadata::MetadataMap;

use crate::context::CallContext;
use crate::message::{AnyMessage, Message};
use crate::method::{MethodName, StreamDesc};
use crate::record::{CallSide, Direction, MessageEvent};
use crate::sink::CallSink;

/// 客户端持有的双向流
#[async_trait]
pub trait ClientStream: Send {
    fn context(&self) -> &CallContext;

    fn method(&self) -> &MethodName;

    /// 等待服务端响应头
    async fn headers(&mut self) -> RpcResult<MetadataMap>;

    /// 流结束后才可用
    fn trailers(&self) -> Option<&MetadataMap>;

    async fn send(&mut self, message: AnyMessage) -> RpcResult<()>;

    /// `Ok(None)` 表示流已结束
    async fn recv(&mut self) -> RpcResult<Option<AnyMessage>>;

    /// 半关闭：不再发送，仍可接收
    async fn close_send(&mut self) -> RpcResult<()>;
}

pub type BoxClientStream = Box<dyn ClientStream>;

#[async_trait]
impl<S> ClientStream for Box<S>
where
    S: ClientStream + ?Sized,
{
    fn context(&self) -> &CallContext {
        (**self).context()
    }

    fn method(&self) -> &MethodName {
        (**self).method()
    }

    async fn headers(&mut self) -> RpcResult<MetadataMap> {
        (**self).headers().await
    }

    fn trailers(&self) -> Option<&MetadataMap> {
        (**self).trailers()
    }

    async fn send(&mut self, message: AnyMessage) -> RpcResult<()> {
        (**self).send(message).await
    }

    async fn recv(&mut self) -> RpcResult<Option<AnyMessage>> {
        (**self).recv().await
    }

    async fn close_send(&mut self) -> RpcResult<()> {
        (**self).close_send().await
    }
}

/// 服务端处理器看到的双向流
#[async_trait]
pub trait ServerStream: Send {
    fn context(&self) -> &CallContext;

    fn method(&self) -> &MethodName;

    async fn send_headers(&mut self, headers: MetadataMap) -> RpcResult<()>;

    /// 处理器返回后随流结束一起发送
    fn set_trailers(&mut self, trailers: MetadataMap);

    async fn send(&mut self, message: AnyMessage) -> RpcResult<()>;

    /// `Ok(None)` 表示客户端已半关闭
    async fn recv(&mut self) -> RpcResult<Option<AnyMessage>>;
}

pub type BoxServerStream = Box<dyn ServerStream>;

#[async_trait]
impl<S> ServerStream for Box<S>
where
    S: ServerStream + ?Sized,
{
    fn context(&self) -> &CallContext {
        (**self).context()
    }

    fn method(&self) -> &MethodName {
        (**self).method()
    }

    async fn send_headers(&mut self, headers: MetadataMap) -> RpcResult<()> {
        (**self).send_headers(headers).await
    }

    fn set_trailers(&mut self, trailers: MetadataMap) {
        (**self).set_trailers(trailers)
    }

    async fn send(&mut self, message: AnyMessage) -> RpcResult<()> {
        (**self).send(message).await
    }

    async fn recv(&mut self) -> RpcResult<Option<AnyMessage>> {
        (**self).recv().await
    }
}

/// 可观察的流包装
pub struct ObservedStream<S> {
    inner: S,
    method: MethodName,
    side: CallSide,
    sink: Arc<dyn CallSink>,
}

impl<S> ObservedStream<S> {
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn observe(&self, direction: Direction, message: &AnyMessage) {
        self.sink.record_message(&MessageEvent::now(
            self.method.clone(),
            self.side,
            direction,
            message.type_name(),
        ));
    }
}

impl<S: ClientStream> ObservedStream<S> {
    pub fn client(inner: S, sink: Arc<dyn CallSink>) -> Self {
        Self {
            method: inner.method().clone(),
            inner,
            side: CallSide::Client,
            sink,
        }
    }
}

impl<S: ServerStream> ObservedStream<S> {
    pub fn server(inner: S, sink: Arc<dyn CallSink>) -> Self {
        Self {
            method: inner.method().clone(),
            inner,
            side: CallSide::Server,
            sink,
        }
    }
}

impl<S> std::fmt::Debug for ObservedStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservedStream")
            .field("method", &self.method)
            .field("side", &self.side)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S: ClientStream> ClientStream for ObservedStream<S> {
    fn context(&self) -> &CallContext {
        self.inner.context()
    }

    fn method(&self) -> &MethodName {
        self.inner.method()
    }

    async fn headers(&mut self) -> RpcResult<MetadataMap> {
        self.inner.headers().await
    }

    fn trailers(&self) -> Option<&MetadataMap> {
        self.inner.trailers()
    }

    async fn send(&mut self, message: AnyMessage) -> RpcResult<()> {
        self.observe(Direction::Send, &message);
        self.inner.send(message).await
    }

    async fn recv(&mut self) -> RpcResult<Option<AnyMessage>> {
        let result = self.inner.recv().await;
        if let Ok(Some(message)) = &result {
            self.observe(Direction::Receive, message);
        }
        result
    }

    async fn close_send(&mut self) -> RpcResult<()> {
        self.inner.close_send().await
    }
}

#[async_trait]
impl<S: ServerStream> ServerStream for ObservedStream<S> {
    fn context(&self) -> &CallContext {
        self.inner.context()
    }

    fn method(&self) -> &MethodName {
        self.inner.method()
    }

    async fn send_headers(&mut self, headers: MetadataMap) -> RpcResult<()> {
        self.inner.send_headers(headers).await
    }

    fn set_trailers(&mut self, trailers: MetadataMap) {
        self.inner.set_trailers(trailers)
    }

    async fn send(&mut self, message: AnyMessage) -> RpcResult<()> {
        self.observe(Direction::Send, &message);
        self.inner.send(message).await
    }

    async fn recv(&mut self) -> RpcResult<Option<AnyMessage>> {
        let result = self.inner.recv().await;
        if let Ok(Some(message)) = &result {
            self.observe(Direction::Receive, message);
        }
        result
    }
}

/// 打开底层流的终端操作
#[async_trait]
pub trait StreamOpener: Send + Sync {
    async fn open(
        &self,
        ctx: CallContext,
        desc: &StreamDesc,
        method: &MethodName,
    ) -> RpcResult<BoxClientStream>;
}

/// 拦截流的打开过程；返回的流所有权交给调用方
#[async_trait]
pub trait StreamInterceptor: Send + Sync {
    async fn intercept(
        &self,
        ctx: CallContext,
        desc: &StreamDesc,
        method: &MethodName,
        next: StreamNext<'_>,
    ) -> RpcResult<BoxClientStream>;
}

pub struct StreamNext<'a> {
    interceptors: &'a [Arc<dyn StreamInterceptor>],
    opener: &'a dyn StreamOpener,
}

impl<'a> StreamNext<'a> {
    pub fn new(interceptors: &'a [Arc<dyn StreamInterceptor>], opener: &'a dyn StreamOpener) -> Self {
        Self {
            interceptors,
            opener,
        }
    }

    pub async fn run(
        self,
        ctx: CallContext,
        desc: &StreamDesc,
        method: &MethodName,
    ) -> RpcResult<BoxClientStream> {
        match self.interceptors.split_first() {
            Some((first, rest)) => {
                let next = StreamNext {
                    interceptors: rest,
                    opener: self.opener,
                };
                first.intercept(ctx, desc, method, next).await
            }
            None => self.opener.open(ctx, desc, method).await,
        }
    }
}

#[derive(Clone)]
pub struct StreamChain {
    interceptors: Vec<Arc<dyn StreamInterceptor>>,
    opener: Arc<dyn StreamOpener>,
}

impl std::fmt::Debug for StreamChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChain")
            .field("interceptors", &self.interceptors.len())
            .finish_non_exhaustive()
    }
}

impl StreamChain {
    pub fn new(opener: Arc<dyn StreamOpener>) -> Self {
        Self {
            interceptors: Vec::new(),
            opener,
        }
    }

    pub fn from_parts(
        interceptors: Vec<Arc<dyn StreamInterceptor>>,
        opener: Arc<dyn StreamOpener>,
    ) -> Self {
        Self {
            interceptors,
            opener,
        }
    }

    #[must_use]
    pub fn with<I>(mut self, interceptor: I) -> Self
    where
        I: StreamInterceptor + 'static,
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
}

#[async_trait]
impl StreamOpener for StreamChain {
    async fn open(
        &self,
        ctx: CallContext,
        desc: &StreamDesc,
        method: &MethodName,
    ) -> RpcResult<BoxClientStream> {
        StreamNext::new(&self.interceptors, self.opener.as_ref())
            .run(ctx, desc, method)
            .await
    }
}

/// 打开成功后把流包装成 `ObservedStream`；打开失败直接返回错误，不构造包装
#[derive(Clone)]
pub struct ObservingStreamInterceptor {
    sink: Arc<dyn CallSink>,
}

impl ObservingStreamInterceptor {
    pub fn new(sink: Arc<dyn CallSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl StreamInterceptor for ObservingStreamInterceptor {
    async fn intercept(
        &self,
        ctx: CallContext,
        desc: &StreamDesc,
        method: &MethodName,
        next: StreamNext<'_>,
    ) -> RpcResult<BoxClientStream> {
        let stream = next.run(ctx, desc, method).await?;
        Ok(Box::new(ObservedStream::client(stream, self.sink.clone())))
    }
}

/// 类型化的客户端流
pub struct TypedClientStream<Req, Resp> {
    inner: BoxClientStream,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req: Message, Resp: Message> TypedClientStream<Req, Resp> {
    pub fn new(inner: BoxClientStream) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub async fn send(&mut self, request: Req) -> RpcResult<()> {
        self.inner.send(AnyMessage::new(request)).await
    }

    pub async fn recv(&mut self) -> RpcResult<Option<Resp>> {
        match self.inner.recv().await? {
            Some(message) => message.downcast::<Resp>().map(Some),
            None => Ok(None),
        }
    }

    pub async fn close_send(&mut self) -> RpcResult<()> {
        self.inner.close_send().await
    }

    pub async fn headers(&mut self) -> RpcResult<MetadataMap> {
        self.inner.headers().await
    }

    pub fn trailers(&self) -> Option<&MetadataMap> {
        self.inner.trailers()
    }

    pub fn into_inner(self) -> BoxClientStream {
        self.inner
    }
}

/// 类型化的服务端流
pub struct TypedServerStream<Req, Resp> {
    inner: BoxServerStream,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req: Message, Resp: Message> TypedServerStream<Req, Resp> {
    pub fn new(inner: BoxServerStream) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub fn context(&self) -> &CallContext {
        self.inner.context()
    }

    pub async fn recv(&mut self) -> RpcResult<Option<Req>> {
        match self.inner.recv().await? {
            Some(message) => message.downcast::<Req>().map(Some),
            None => Ok(None),
        }
    }

    pub async fn send(&mut self, response: Resp) -> RpcResult<()> {
        self.inner.send(AnyMessage::new(response)).await
    }

    pub async fn send_headers(&mut self, headers: MetadataMap) -> RpcResult<()> {
        self.inner.send_headers(headers).await
    }

    pub fn set_trailers(&mut self, trailers: MetadataMap) {
        self.inner.set_trailers(trailers)
    }
}
