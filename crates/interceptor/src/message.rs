//! 动态类型的消息封装
//!
//! 拦截器不关心具体的请求/响应类型，链路上传递的都是 `AnyMessage`，
//! 由类型化的存根和处理器适配器在两端做向下转换。

use std::any::{Any, type_name};
use std::fmt;

use relay_errors::{RpcError, RpcResult};

/// 可以在拦截链上传递的消息
pub trait Message: Any + Send + Sync + fmt::Debug {
    /// 声明的消息类型名，作为观察记录里的类型标签
    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<T> Message for T
where
    T: Any + Send + Sync + fmt::Debug,
{
    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

/// 类型擦除后的消息
pub struct AnyMessage(Box<dyn Message>);

impl AnyMessage {
    pub fn new<T: Message>(message: T) -> Self {
        Self(Box::new(message))
    }

    fn inner(&self) -> &dyn Message {
        &*self.0
    }

    pub fn type_name(&self) -> &'static str {
        self.inner().type_name()
    }

    pub fn is<T: Message>(&self) -> bool {
        self.inner().as_any().is::<T>()
    }

    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.inner().as_any().downcast_ref::<T>()
    }

    /// 取回具体类型，类型不符时返回 `Internal` 状态
    pub fn downcast<T: Message>(self) -> RpcResult<T> {
        let actual = self.type_name();
        self.0
            .into_any()
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| {
                RpcError::internal(format!(
                    "unexpected message type: expected {}, got {}",
                    type_name::<T>(),
                    actual
                ))
            })
    }
}

impl fmt::Debug for AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.inner(), f)
    }
}
