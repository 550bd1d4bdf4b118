//! 演示流程
//!
//! 先发一次一元调用，再打开双向流发送若干请求、半关闭、读到流结束。

use std::time::Duration;

use relay_errors::RpcResult;
use relay_interceptor::CallContext;
use tracing::info;

use crate::client::ProductClient;
use crate::proto::{ProductRequest, ProductResponse};

/// 演示调用的超时
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn call_unary_get_product(client: &ProductClient, id: &str) -> RpcResult<ProductResponse> {
    let ctx = CallContext::new().with_timeout(CALL_TIMEOUT);
    client.get_product(ctx, ProductRequest::new(id)).await
}

/// 发送 `count` 个请求后半关闭，返回收到的全部响应
pub async fn call_bidirectional_streaming(
    client: &ProductClient,
    count: usize,
) -> RpcResult<Vec<ProductResponse>> {
    let ctx = CallContext::new().with_timeout(CALL_TIMEOUT);
    let mut stream = client.bidirectional_streaming(ctx).await?;

    for i in 1..=count {
        stream.send(ProductRequest::new(format!("Request {i}"))).await?;
    }
    stream.close_send().await?;

    let mut responses = Vec::with_capacity(count);
    while let Some(response) = stream.recv().await? {
        responses.push(response);
    }
    info!(received = responses.len(), "Stream finished");
    Ok(responses)
}
