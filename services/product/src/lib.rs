//! product-service - 商品服务
//!
//! 一个一元方法加一个双向流方法，用来演示完整的拦截链

pub mod client;
pub mod demo;
pub mod proto;
pub mod service;

pub use client::ProductClient;
pub use proto::{ProductRequest, ProductResponse};
pub use service::ProductService;
