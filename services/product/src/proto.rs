//! 消息类型与方法标识

use relay_interceptor::StreamDesc;

pub const GET_PRODUCT: &str = "/product.ProductService/GetProduct";

pub const BIDIRECTIONAL_STREAMING: &str = "/product.ProductService/BidirectionalStreaming";

pub fn bidirectional_streaming_desc() -> StreamDesc {
    StreamDesc::bidirectional("BidirectionalStreaming")
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProductRequest {
    pub id: String,
}

impl ProductRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProductResponse {
    pub id: String,
    pub name: String,
    pub price: f64,
}
