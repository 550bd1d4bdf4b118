//! 类型化客户端存根

use relay_errors::RpcResult;
use relay_interceptor::{CallContext, Channel, TypedClientStream};

use crate::proto::{
    BIDIRECTIONAL_STREAMING, GET_PRODUCT, ProductRequest, ProductResponse,
    bidirectional_streaming_desc,
};

#[derive(Debug, Clone)]
pub struct ProductClient {
    channel: Channel,
}

impl ProductClient {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub async fn get_product(
        &self,
        ctx: CallContext,
        request: ProductRequest,
    ) -> RpcResult<ProductResponse> {
        self.channel.call(ctx, &GET_PRODUCT.into(), request).await
    }

    pub async fn bidirectional_streaming(
        &self,
        ctx: CallContext,
    ) -> RpcResult<TypedClientStream<ProductRequest, ProductResponse>> {
        self.channel
            .open_typed(ctx, &bidirectional_streaming_desc(), &BIDIRECTIONAL_STREAMING.into())
            .await
    }
}
