//! relay-interceptor - RPC 拦截链
//!
//! 客户端的一元拦截链与流拦截器、服务端分发拦截器，以及把双向流包装成
//! 可观察流的 `ObservedStream`。传输与序列化不在这里实现，只通过
//! `UnaryInvoker` / `StreamOpener` / `UnaryHandler` / `StreamHandler` 接入。

pub mod client;
pub mod context;
pub mod loopback;
pub mod message;
pub mod method;
pub mod record;
pub mod server;
pub mod sink;
pub mod stream;
pub mod unary;

pub use client::*;
pub use context::*;
pub use loopback::*;
pub use message::*;
pub use method::*;
pub use record::*;
pub use server::*;
pub use sink::*;
pub use stream::*;
pub use unary::*;

pub use relay_errors::{RpcError, RpcResult, StatusInfo};
