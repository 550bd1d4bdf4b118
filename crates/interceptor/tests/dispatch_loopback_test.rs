//! 服务端分发与回环传输测试

use std::sync::Arc;
use std::time::Duration;

use relay_interceptor::{
    AnyMessage, CallContext, CallKind, CallSide, Channel, Direction, DispatchLoggingInterceptor,
    LoopbackTransport, MemorySink, MethodName, ObservingServerStreamInterceptor,
    ObservingStreamInterceptor, RpcError, Server, StreamDesc, TimingInterceptor,
    TypedServerStream, stream_fn, unary_fn,
};
use tonic::metadata::MetadataMap;

#[derive(Debug, Clone, PartialEq)]
struct EchoRequest {
    text: String,
}

#[derive(Debug, Clone, PartialEq)]
struct EchoReply {
    text: String,
}

const GET: &str = "/test.Echo/Get";
const FAIL: &str = "/test.Echo/Fail";
const OPAQUE: &str = "/test.Echo/Opaque";
const SLOW: &str = "/test.Echo/Slow";
const CHAT: &str = "/test.Echo/Chat";
const BROKEN_CHAT: &str = "/test.Echo/BrokenChat";

fn echo_server(sink: Arc<MemorySink>, observe_streams: bool) -> Server {
    let mut builder = Server::builder()
        .unary_interceptor(DispatchLoggingInterceptor::new(sink.clone()))
        .stream_interceptor(DispatchLoggingInterceptor::new(sink.clone()));
    if observe_streams {
        builder = builder.stream_interceptor(ObservingServerStreamInterceptor::new(sink));
    }

    builder
        .unary(
            GET,
            unary_fn(|_ctx: CallContext, request: EchoRequest| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, RpcError>(EchoReply {
                    text: request.text.to_uppercase(),
                })
            }),
        )
        .unary(
            FAIL,
            unary_fn(|_ctx: CallContext, request: EchoRequest| async move {
                Err::<EchoReply, _>(RpcError::invalid_argument(format!("bad text {}", request.text)))
            }),
        )
        .unary(
            OPAQUE,
            unary_fn(|_ctx: CallContext, _request: EchoRequest| async move {
                Err::<EchoReply, _>(RpcError::opaque("database is on fire"))
            }),
        )
        .unary(
            SLOW,
            unary_fn(|_ctx: CallContext, _request: EchoRequest| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, RpcError>(EchoReply {
                    text: "late".to_string(),
                })
            }),
        )
        .stream(
            CHAT,
            StreamDesc::bidirectional("Chat"),
            stream_fn(
                |mut stream: TypedServerStream<EchoRequest, EchoReply>| async move {
                    let mut trailers = MetadataMap::new();
                    trailers.insert("x-handled", "chat".parse().unwrap());
                    stream.set_trailers(trailers);
                    while let Some(request) = stream.recv().await? {
                        stream
                            .send(EchoReply {
                                text: format!("echo {}", request.text),
                            })
                            .await?;
                    }
                    Ok::<(), RpcError>(())
                },
            ),
        )
        .stream(
            BROKEN_CHAT,
            StreamDesc::bidirectional("BrokenChat"),
            stream_fn(
                |mut stream: TypedServerStream<EchoRequest, EchoReply>| async move {
                    stream
                        .send(EchoReply {
                            text: "first".to_string(),
                        })
                        .await?;
                    Err::<(), _>(RpcError::invalid_argument("chat rejected"))
                },
            ),
        )
        .build()
}

fn request(text: &str) -> AnyMessage {
    AnyMessage::new(EchoRequest {
        text: text.to_string(),
    })
}

#[tokio::test]
async fn test_dispatch_logs_method_and_duration() {
    let sink = Arc::new(MemorySink::new());
    let server = echo_server(sink.clone(), false);

    let response = server
        .dispatch_unary(CallContext::new(), &GET.into(), request("hi"))
        .await
        .unwrap()
        .downcast::<EchoReply>()
        .unwrap();
    assert_eq!(response.text, "HI");

    let calls = sink.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method.as_str(), GET);
    assert_eq!(calls[0].side, CallSide::Server);
    assert_eq!(calls[0].kind, CallKind::Unary);
    assert!(calls[0].elapsed >= Duration::from_millis(5));
    assert_eq!(calls[0].status.code, tonic::Code::Ok);
}

#[tokio::test]
async fn test_dispatch_logs_structured_error() {
    let sink = Arc::new(MemorySink::new());
    let server = echo_server(sink.clone(), false);

    let err = server
        .dispatch_unary(CallContext::new(), &FAIL.into(), request("??"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
    assert_eq!(err.status_info().message, "bad text ??");

    let calls = sink.calls();
    assert_eq!(calls[0].status.code, tonic::Code::InvalidArgument);
    assert_eq!(calls[0].status.message, "bad text ??");
}

#[tokio::test]
async fn test_plain_error_is_logged_as_unknown_and_returned_unchanged() {
    let sink = Arc::new(MemorySink::new());
    let server = echo_server(sink.clone(), false);

    let err = server
        .dispatch_unary(CallContext::new(), &OPAQUE.into(), request("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Transport(_)));
    assert_eq!(err.to_string(), "database is on fire");

    let calls = sink.calls();
    assert_eq!(calls[0].status.code, tonic::Code::Unknown);
    assert_eq!(calls[0].status.message, "database is on fire");
}

#[tokio::test]
async fn test_unknown_method_is_unimplemented_and_logged() {
    let sink = Arc::new(MemorySink::new());
    let server = echo_server(sink.clone(), false);
    assert!(!server.has_unary("/test.Echo/Missing"));

    let err = server
        .dispatch_unary(CallContext::new(), &"/test.Echo/Missing".into(), request("x"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::Unimplemented);

    let calls = sink.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method.as_str(), "/test.Echo/Missing");
    assert_eq!(calls[0].status.code, tonic::Code::Unimplemented);
}

#[tokio::test]
async fn test_loopback_unary_round_trip_logs_both_sides() {
    let server_sink = Arc::new(MemorySink::new());
    let client_sink = Arc::new(MemorySink::new());
    let server = Arc::new(echo_server(server_sink.clone(), false));
    let channel = Channel::builder(LoopbackTransport::new(server))
        .unary_interceptor(TimingInterceptor::new(client_sink.clone()))
        .build();

    let reply: EchoReply = channel
        .call(
            CallContext::new(),
            &GET.into(),
            EchoRequest {
                text: "loop".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(reply.text, "LOOP");

    let client_calls = client_sink.calls();
    let server_calls = server_sink.calls();
    assert_eq!(client_calls.len(), 1);
    assert_eq!(server_calls.len(), 1);
    assert_eq!(client_calls[0].side, CallSide::Client);
    assert_eq!(server_calls[0].side, CallSide::Server);
    assert!(client_calls[0].elapsed >= server_calls[0].elapsed);
}

#[tokio::test]
async fn test_loopback_cancellation_reaches_caller() {
    let sink = Arc::new(MemorySink::new());
    let server = Arc::new(echo_server(sink.clone(), false));
    let channel = Channel::builder(LoopbackTransport::new(server))
        .unary_interceptor(TimingInterceptor::new(sink.clone()))
        .build();

    let ctx = CallContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });

    let err = channel
        .unary(ctx, &SLOW.into(), request("x"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::Cancelled);

    // 服务端分发日志先于客户端耗时记录
    let calls = sink.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].side, CallSide::Server);
    assert_eq!(calls[1].side, CallSide::Client);
    assert!(calls.iter().all(|call| call.status.code == tonic::Code::Cancelled));
}

#[tokio::test]
async fn test_default_timeout_gives_deadline_exceeded() {
    let sink = Arc::new(MemorySink::new());
    let server = Arc::new(echo_server(sink.clone(), false));
    let channel = Channel::builder(LoopbackTransport::new(server))
        .unary_interceptor(TimingInterceptor::new(sink.clone()))
        .default_timeout(Some(Duration::from_millis(20)))
        .build();

    let err = channel
        .unary(CallContext::new(), &SLOW.into(), request("x"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::DeadlineExceeded);

    let calls = sink.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].side, CallSide::Server);
    assert_eq!(calls[0].method.as_str(), SLOW);
    assert_eq!(calls[1].side, CallSide::Client);
    assert!(
        calls
            .iter()
            .all(|call| call.status.code == tonic::Code::DeadlineExceeded)
    );
}

#[tokio::test]
async fn test_already_cancelled_call_is_logged_by_server() {
    let sink = Arc::new(MemorySink::new());
    let server = Arc::new(echo_server(sink.clone(), false));
    let channel = Channel::builder(LoopbackTransport::new(server)).build();

    let ctx = CallContext::new();
    ctx.cancel();
    let err = channel.unary(ctx, &GET.into(), request("x")).await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::Cancelled);

    let calls = sink.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].side, CallSide::Server);
    assert_eq!(calls[0].status.code, tonic::Code::Cancelled);
}

#[tokio::test]
async fn test_loopback_bidi_stream_observed_on_both_sides() {
    let server_sink = Arc::new(MemorySink::new());
    let client_sink = Arc::new(MemorySink::new());
    let server = Arc::new(echo_server(server_sink.clone(), true));
    let channel = Channel::builder(LoopbackTransport::new(server))
        .stream_interceptor(ObservingStreamInterceptor::new(client_sink.clone()))
        .build();

    let mut stream = channel
        .open_typed::<EchoRequest, EchoReply>(
            CallContext::new(),
            &StreamDesc::bidirectional("Chat"),
            &CHAT.into(),
        )
        .await
        .unwrap();

    for i in 1..=5 {
        stream
            .send(EchoRequest {
                text: format!("Request {i}"),
            })
            .await
            .unwrap();
    }
    stream.close_send().await.unwrap();

    let mut replies = Vec::new();
    while let Some(reply) = stream.recv().await.unwrap() {
        replies.push(reply.text);
    }
    assert_eq!(
        replies,
        (1..=5).map(|i| format!("echo Request {i}")).collect::<Vec<_>>()
    );
    assert!(stream.recv().await.unwrap().is_none());

    let trailers = stream.trailers().expect("trailers after end of stream");
    assert_eq!(trailers.get("x-handled").unwrap().to_str().unwrap(), "chat");

    assert_eq!(client_sink.message_types(Direction::Send).len(), 5);
    assert_eq!(client_sink.message_types(Direction::Receive).len(), 5);
    assert_eq!(server_sink.message_types(Direction::Receive).len(), 5);
    assert_eq!(server_sink.message_types(Direction::Send).len(), 5);

    // 处理器任务在发送结束帧之前已记录日志
    let calls = server_sink.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].kind, CallKind::Stream);
    assert_eq!(calls[0].status.code, tonic::Code::Ok);
}

#[tokio::test]
async fn test_stream_handler_error_is_final_recv() {
    let server_sink = Arc::new(MemorySink::new());
    let server = Arc::new(echo_server(server_sink.clone(), false));
    let channel = Channel::builder(LoopbackTransport::new(server)).build();

    let mut stream = channel
        .open_typed::<EchoRequest, EchoReply>(
            CallContext::new(),
            &StreamDesc::bidirectional("BrokenChat"),
            &BROKEN_CHAT.into(),
        )
        .await
        .unwrap();

    assert_eq!(stream.recv().await.unwrap().unwrap().text, "first");
    let err = stream.recv().await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
    assert_eq!(err.status_info().message, "chat rejected");

    // 结束状态会重复返回
    let again = stream.recv().await.unwrap_err();
    assert_eq!(again.code(), tonic::Code::InvalidArgument);

    let calls = server_sink.calls();
    assert_eq!(calls[0].status.code, tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn test_open_unknown_stream_is_unimplemented() {
    let client_sink = Arc::new(MemorySink::new());
    let server = Arc::new(echo_server(Arc::new(MemorySink::new()), false));
    let channel = Channel::builder(LoopbackTransport::new(server))
        .stream_interceptor(ObservingStreamInterceptor::new(client_sink.clone()))
        .build();

    let method: MethodName = "/test.Echo/Nope".into();
    let err = channel
        .open_stream(CallContext::new(), &StreamDesc::bidirectional("Nope"), &method)
        .await
        .err()
        .expect("unknown stream must fail to open");
    assert_eq!(err.code(), tonic::Code::Unimplemented);
    assert!(client_sink.messages().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_unary_calls_over_loopback() {
    let server_sink = Arc::new(MemorySink::new());
    let server = Arc::new(echo_server(server_sink.clone(), false));
    let channel = Channel::builder(LoopbackTransport::new(server)).build();

    let calls = (0..16).map(|i| {
        let channel = channel.clone();
        async move {
            channel
                .call::<EchoRequest, EchoReply>(
                    CallContext::new(),
                    &GET.into(),
                    EchoRequest {
                        text: format!("m{i}"),
                    },
                )
                .await
        }
    });

    let replies = futures::future::join_all(calls).await;
    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.unwrap().text, format!("M{i}"));
    }
    assert_eq!(server_sink.calls().len(), 16);
}
