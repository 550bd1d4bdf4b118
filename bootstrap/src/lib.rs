//! relay-bootstrap - 统一启动骨架
//!
//! 按配置初始化日志/指标，并组装客户端和服务端的标准拦截链

mod interceptor;
mod metrics;
mod runtime;

pub use self::interceptor::*;
pub use self::metrics::*;
pub use self::runtime::*;
