//! relay-errors - 统一错误处理
//!
//! RPC 调用链上只有两类错误：带结构化状态码的 `Status`，以及传输层/处理器
//! 返回的不透明错误。流结束不是错误，由 `Ok(None)` 表示。

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;
use tonic::{Code, Status};

/// 不透明错误
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// RPC 错误类型
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("{}", fmt_status(.0))]
    Status(Status),

    #[error("{0}")]
    Transport(#[source] BoxError),
}

fn fmt_status(status: &Status) -> String {
    format!("status: {:?}, message: {:?}", status.code(), status.message())
}

impl RpcError {
    pub fn new(code: Code, msg: impl Into<String>) -> Self {
        Self::Status(Status::new(code, msg))
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(Code::NotFound, msg)
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(Code::Internal, msg)
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, msg)
    }

    pub fn deadline_exceeded(msg: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, msg)
    }

    pub fn unimplemented(msg: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, msg)
    }

    /// 包装一个不带状态码的普通错误
    pub fn opaque<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Transport(err.into())
    }

    /// 结构化状态（如果有）
    pub fn as_status(&self) -> Option<&Status> {
        match self {
            Self::Status(status) => Some(status),
            Self::Transport(_) => None,
        }
    }

    /// 提取状态码与消息，不改变错误本身
    ///
    /// 普通错误没有结构化状态，退化为 `Code::Unknown` 加上错误的文本。
    pub fn status_info(&self) -> StatusInfo {
        match self {
            Self::Status(status) => StatusInfo {
                code: status.code(),
                message: status.message().to_string(),
            },
            Self::Transport(err) => StatusInfo {
                code: Code::Unknown,
                message: err.to_string(),
            },
        }
    }

    pub fn code(&self) -> Code {
        match self {
            Self::Status(status) => status.code(),
            Self::Transport(_) => Code::Unknown,
        }
    }
}

impl From<Status> for RpcError {
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}

impl From<RpcError> for Status {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Status(status) => status,
            RpcError::Transport(err) => Status::unknown(err.to_string()),
        }
    }
}

/// 从错误中提取出的状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusInfo {
    pub code: Code,
    pub message: String,
}

impl StatusInfo {
    /// 成功调用对应的状态
    pub fn ok() -> Self {
        Self {
            code: Code::Ok,
            message: String::new(),
        }
    }

    /// 从任意调用结果中提取
    pub fn from_result<T>(result: &Result<T, RpcError>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(err) => err.status_info(),
        }
    }

    /// 状态码的规范名称，用于日志和指标标签
    pub fn code_name(&self) -> &'static str {
        code_name(self.code)
    }
}

impl fmt::Display for StatusInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_name(), self.message)
    }
}

impl From<StatusInfo> for Status {
    fn from(info: StatusInfo) -> Self {
        Status::new(info.code, info.message)
    }
}

/// gRPC 状态码名称
pub fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELLED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
        #[allow(unreachable_patterns)]
        _ => "UNKNOWN",
    }
}

/// Result 类型别名
pub type RpcResult<T> = Result<T, RpcError>;
