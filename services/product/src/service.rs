//! 商品服务处理器

use std::sync::Arc;

use relay_errors::RpcResult;
use relay_interceptor::{CallContext, ServerBuilder, TypedServerStream, stream_fn, unary_fn};
use tracing::info;

use crate::proto::{
    BIDIRECTIONAL_STREAMING, GET_PRODUCT, ProductRequest, ProductResponse,
    bidirectional_streaming_desc,
};

#[derive(Debug, Clone, Default)]
pub struct ProductService;

impl ProductService {
    pub fn new() -> Self {
        Self
    }

    pub async fn get_product(
        &self,
        _ctx: CallContext,
        request: ProductRequest,
    ) -> RpcResult<ProductResponse> {
        Ok(ProductResponse {
            id: request.id,
            name: "Example Product".to_string(),
            price: 99.99,
        })
    }

    /// 每收到一个请求回一条 "Received"，客户端半关闭后正常结束
    pub async fn bidirectional_streaming(
        &self,
        mut stream: TypedServerStream<ProductRequest, ProductResponse>,
    ) -> RpcResult<()> {
        while let Some(request) = stream.recv().await? {
            info!(id = %request.id, "Received message");
            stream
                .send(ProductResponse {
                    id: request.id,
                    name: "Received".to_string(),
                    price: 0.0,
                })
                .await?;
        }
        Ok(())
    }

    /// 把两个方法注册到服务构建器
    pub fn register(self, builder: ServerBuilder) -> ServerBuilder {
        let service = Arc::new(self);
        let unary = service.clone();

        builder
            .unary(
                GET_PRODUCT,
                unary_fn(move |ctx: CallContext, request: ProductRequest| {
                    let service = unary.clone();
                    async move { service.get_product(ctx, request).await }
                }),
            )
            .stream(
                BIDIRECTIONAL_STREAMING,
                bidirectional_streaming_desc(),
                stream_fn(
                    move |stream: TypedServerStream<ProductRequest, ProductResponse>| {
                        let service = service.clone();
                        async move { service.bidirectional_streaming(stream).await }
                    },
                ),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_interceptor::{AnyMessage, Server};

    #[tokio::test]
    async fn test_get_product_returns_example_product() {
        let response = ProductService::new()
            .get_product(CallContext::new(), ProductRequest::new("1234"))
            .await
            .unwrap();

        assert_eq!(response.id, "1234");
        assert_eq!(response.name, "Example Product");
        assert_eq!(response.price, 99.99);
    }

    #[tokio::test]
    async fn test_register_exposes_both_methods() {
        let server = ProductService::new().register(Server::builder()).build();
        assert!(server.has_unary(GET_PRODUCT));
        assert!(server.stream_desc(BIDIRECTIONAL_STREAMING).is_some());

        let response = server
            .dispatch_unary(
                CallContext::new(),
                &GET_PRODUCT.into(),
                AnyMessage::new(ProductRequest::new("42")),
            )
            .await
            .unwrap()
            .downcast::<ProductResponse>()
            .unwrap();
        assert_eq!(response.id, "42");
    }
}
