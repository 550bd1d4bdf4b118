//! 客户端通道
//!
//! `Channel` 在构建时一次性组装一元链和流链，之后可以 clone 到多个任务里并发使用。

use std::sync::Arc;
use std::time::Duration;

use relay_errors::RpcResult;

use crate::context::CallContext;
use crate::message::{AnyMessage, Message};
use crate::method::{MethodName, StreamDesc};
use crate::stream::{BoxClientStream, StreamChain, StreamInterceptor, StreamOpener, TypedClientStream};
use crate::unary::{DeadlineInterceptor, UnaryChain, UnaryInterceptor, UnaryInvoker};

/// 传输层边界：既能发起一元调用，也能打开流
pub trait Transport: UnaryInvoker + StreamOpener {}

impl<T> Transport for T where T: UnaryInvoker + StreamOpener {}

#[derive(Clone, Debug)]
pub struct Channel {
    unary: Arc<UnaryChain>,
    streams: Arc<StreamChain>,
}

impl Channel {
    pub fn builder<T>(transport: T) -> ChannelBuilder
    where
        T: Transport + 'static,
    {
        Self::builder_from_arc(Arc::new(transport))
    }

    pub fn builder_from_arc<T>(transport: Arc<T>) -> ChannelBuilder
    where
        T: Transport + 'static,
    {
        let invoker: Arc<dyn UnaryInvoker> = transport.clone();
        let opener: Arc<dyn StreamOpener> = transport;
        ChannelBuilder {
            invoker,
            opener,
            unary_interceptors: Vec::new(),
            stream_interceptors: Vec::new(),
            default_timeout: None,
        }
    }

    /// 经过一元拦截链发起调用
    pub async fn unary(
        &self,
        ctx: CallContext,
        method: &MethodName,
        request: AnyMessage,
    ) -> RpcResult<AnyMessage> {
        self.unary.invoke(ctx, method, request).await
    }

    /// 类型化的一元调用
    pub async fn call<Req, Resp>(
        &self,
        ctx: CallContext,
        method: &MethodName,
        request: Req,
    ) -> RpcResult<Resp>
    where
        Req: Message,
        Resp: Message,
    {
        self.unary(ctx, method, AnyMessage::new(request))
            .await?
            .downcast::<Resp>()
    }

    /// 经过流拦截链打开流
    pub async fn open_stream(
        &self,
        ctx: CallContext,
        desc: &StreamDesc,
        method: &MethodName,
    ) -> RpcResult<BoxClientStream> {
        self.streams.open(ctx, desc, method).await
    }

    pub async fn open_typed<Req, Resp>(
        &self,
        ctx: CallContext,
        desc: &StreamDesc,
        method: &MethodName,
    ) -> RpcResult<TypedClientStream<Req, Resp>>
    where
        Req: Message,
        Resp: Message,
    {
        self.open_stream(ctx, desc, method)
            .await
            .map(TypedClientStream::new)
    }
}

pub struct ChannelBuilder {
    invoker: Arc<dyn UnaryInvoker>,
    opener: Arc<dyn StreamOpener>,
    unary_interceptors: Vec<Arc<dyn UnaryInterceptor>>,
    stream_interceptors: Vec<Arc<dyn StreamInterceptor>>,
    default_timeout: Option<Duration>,
}

impl ChannelBuilder {
    /// 追加一元拦截器；先追加的在外层
    #[must_use]
    pub fn unary_interceptor<I>(mut self, interceptor: I) -> Self
    where
        I: UnaryInterceptor + 'static,
    {
        self.unary_interceptors.push(Arc::new(interceptor));
        self
    }

    #[must_use]
    pub fn stream_interceptor<I>(mut self, interceptor: I) -> Self
    where
        I: StreamInterceptor + 'static,
    {
        self.stream_interceptors.push(Arc::new(interceptor));
        self
    }

    /// 一元调用未携带截止时间时使用的超时，作为最外层拦截器生效
    #[must_use]
    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn build(self) -> Channel {
        let mut unary = self.unary_interceptors;
        if let Some(timeout) = self.default_timeout {
            unary.insert(0, Arc::new(DeadlineInterceptor::new(timeout)));
        }
        Channel {
            unary: Arc::new(UnaryChain::from_parts(unary, self.invoker)),
            streams: Arc::new(StreamChain::from_parts(
                self.stream_interceptors,
                self.opener,
            )),
        }
    }
}
