//! 进程内回环传输
//!
//! 把 `Channel` 直接接到同进程的 `Server` 上，不做任何编解码。一元调用的
//! 取消和截止时间在服务端链末端执行；流用两条有界 mpsc 通道连接，服务端处理器
//! 跑在单独的任务上，它的最终错误作为客户端最后一次 `recv` 的结果返回。

use std::mem;
use std::sync::Arc;

use async_trait::async_trait;
use relay_errors::{RpcError, RpcResult};
use tokio::sync::{mpsc, oneshot};
use tonic::Status;
use tonic::metadata::MetadataMap;
use tracing::debug;

use crate::context::CallContext;
use crate::message::AnyMessage;
use crate::method::{MethodName, StreamDesc};
use crate::server::Server;
use crate::stream::{BoxClientStream, ClientStream, ServerStream, StreamOpener};
use crate::unary::UnaryInvoker;

const DEFAULT_BUFFER: usize = 16;

#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    server: Arc<Server>,
    buffer: usize,
}

impl LoopbackTransport {
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            buffer: DEFAULT_BUFFER,
        }
    }

    /// 每个方向的消息缓冲数量，至少为 1
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }
}

#[async_trait]
impl UnaryInvoker for LoopbackTransport {
    async fn invoke(
        &self,
        ctx: CallContext,
        method: &MethodName,
        request: AnyMessage,
    ) -> RpcResult<AnyMessage> {
        // 取消和超时由服务端链末端的处理器守卫执行，分发拦截器总能看到结果
        self.server.dispatch_unary(ctx, method, request).await
    }
}

/// 服务端发往客户端的帧
enum ServerFrame {
    Headers(MetadataMap),
    Message(AnyMessage),
    End {
        trailers: MetadataMap,
        error: Option<RpcError>,
    },
}

#[async_trait]
impl StreamOpener for LoopbackTransport {
    async fn open(
        &self,
        ctx: CallContext,
        desc: &StreamDesc,
        method: &MethodName,
    ) -> RpcResult<BoxClientStream> {
        ctx.check_live()?;
        if self.server.stream_desc(method.as_str()).is_none() {
            return Err(RpcError::unimplemented(format!(
                "unknown stream method {}",
                method
            )));
        }

        let (request_tx, request_rx) = mpsc::channel(self.buffer);
        let (frame_tx, frame_rx) = mpsc::channel(self.buffer);
        let (trailer_tx, trailer_rx) = oneshot::channel();

        let server_half = LoopbackServerStream {
            ctx: ctx.clone(),
            method: method.clone(),
            requests: request_rx,
            frames: frame_tx.clone(),
            headers_sent: false,
            trailers: MetadataMap::new(),
            trailer_tx: Some(trailer_tx),
        };

        let server = self.server.clone();
        let stream_name = desc.name.clone();
        tokio::spawn(async move {
            let result = server.dispatch_stream(Box::new(server_half)).await;
            // 处理器返回时服务端流已被丢弃，尾部随之送出
            let trailers = trailer_rx.await.unwrap_or_default();
            debug!(stream = %stream_name, ok = result.is_ok(), "Loopback stream handler finished");
            let _ = frame_tx
                .send(ServerFrame::End {
                    trailers,
                    error: result.err(),
                })
                .await;
        });

        Ok(Box::new(LoopbackClientStream {
            ctx,
            method: method.clone(),
            requests: Some(request_tx),
            frames: frame_rx,
            headers: None,
            trailers: None,
            pending_end: None,
            finished: None,
        }))
    }
}

struct LoopbackServerStream {
    ctx: CallContext,
    method: MethodName,
    requests: mpsc::Receiver<AnyMessage>,
    frames: mpsc::Sender<ServerFrame>,
    headers_sent: bool,
    trailers: MetadataMap,
    trailer_tx: Option<oneshot::Sender<MetadataMap>>,
}

impl LoopbackServerStream {
    async fn push(&mut self, frame: ServerFrame) -> RpcResult<()> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| RpcError::unavailable("client went away"))
    }
}

impl Drop for LoopbackServerStream {
    fn drop(&mut self) {
        if let Some(tx) = self.trailer_tx.take() {
            let _ = tx.send(mem::take(&mut self.trailers));
        }
    }
}

#[async_trait]
impl ServerStream for LoopbackServerStream {
    fn context(&self) -> &CallContext {
        &self.ctx
    }

    fn method(&self) -> &MethodName {
        &self.method
    }

    async fn send_headers(&mut self, headers: MetadataMap) -> RpcResult<()> {
        if self.headers_sent {
            return Err(RpcError::internal("headers already sent"));
        }
        self.headers_sent = true;
        self.push(ServerFrame::Headers(headers)).await
    }

    fn set_trailers(&mut self, trailers: MetadataMap) {
        self.trailers = trailers;
    }

    async fn send(&mut self, message: AnyMessage) -> RpcResult<()> {
        if !self.headers_sent {
            self.send_headers(MetadataMap::new()).await?;
        }
        self.push(ServerFrame::Message(message)).await
    }

    async fn recv(&mut self) -> RpcResult<Option<AnyMessage>> {
        let requests = &mut self.requests;
        self.ctx.guard(async { Ok(requests.recv().await) }).await
    }
}

struct LoopbackClientStream {
    ctx: CallContext,
    method: MethodName,
    requests: Option<mpsc::Sender<AnyMessage>>,
    frames: mpsc::Receiver<ServerFrame>,
    headers: Option<MetadataMap>,
    trailers: Option<MetadataMap>,
    /// 读取头部时提前收到的结束帧
    pending_end: Option<Option<RpcError>>,
    /// 流结束后的状态，之后的 `recv` 重复返回它
    finished: Option<Option<Status>>,
}

impl LoopbackClientStream {
    async fn next_frame(&mut self) -> RpcResult<ServerFrame> {
        let frames = &mut self.frames;
        self.ctx.guard(async {
            frames
                .recv()
                .await
                .ok_or_else(|| RpcError::internal("stream terminated without status"))
        })
        .await
    }

    fn finish(&mut self, trailers: MetadataMap, error: Option<RpcError>) -> RpcResult<Option<AnyMessage>> {
        if self.headers.is_none() {
            self.headers = Some(MetadataMap::new());
        }
        self.trailers = Some(trailers);
        self.end(error)
    }

    fn end(&mut self, error: Option<RpcError>) -> RpcResult<Option<AnyMessage>> {
        self.requests = None;
        match error {
            None => {
                self.finished = Some(None);
                Ok(None)
            }
            Some(err) => {
                self.finished = Some(Some(Status::from(err.status_info())));
                Err(err)
            }
        }
    }
}

#[async_trait]
impl ClientStream for LoopbackClientStream {
    fn context(&self) -> &CallContext {
        &self.ctx
    }

    fn method(&self) -> &MethodName {
        &self.method
    }

    async fn headers(&mut self) -> RpcResult<MetadataMap> {
        if let Some(headers) = &self.headers {
            return Ok(headers.clone());
        }
        if self.finished.is_some() {
            return Ok(MetadataMap::new());
        }
        match self.next_frame().await? {
            ServerFrame::Headers(headers) => {
                self.headers = Some(headers.clone());
                Ok(headers)
            }
            ServerFrame::End { trailers, error } => {
                self.headers = Some(MetadataMap::new());
                self.trailers = Some(trailers);
                self.pending_end = Some(error);
                Ok(MetadataMap::new())
            }
            // 服务端总是先发头部再发消息
            ServerFrame::Message(_) => Err(RpcError::internal("message arrived before headers")),
        }
    }

    fn trailers(&self) -> Option<&MetadataMap> {
        self.trailers.as_ref()
    }

    async fn send(&mut self, message: AnyMessage) -> RpcResult<()> {
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| RpcError::internal("send after close_send"))?;
        requests
            .send(message)
            .await
            .map_err(|_| RpcError::unavailable("stream closed by server"))
    }

    async fn recv(&mut self) -> RpcResult<Option<AnyMessage>> {
        if let Some(error) = self.pending_end.take() {
            return self.end(error);
        }
        if let Some(finished) = &self.finished {
            return match finished {
                None => Ok(None),
                Some(status) => Err(RpcError::Status(status.clone())),
            };
        }
        loop {
            match self.next_frame().await? {
                ServerFrame::Headers(headers) => self.headers = Some(headers),
                ServerFrame::Message(message) => return Ok(Some(message)),
                ServerFrame::End { trailers, error } => return self.finish(trailers, error),
            }
        }
    }

    async fn close_send(&mut self) -> RpcResult<()> {
        self.requests = None;
        Ok(())
    }
}
