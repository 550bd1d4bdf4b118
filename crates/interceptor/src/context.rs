//! 调用上下文
//!
//! 截止时间、取消令牌和调用元数据。拦截层只传递它，真正执行取消和超时的是
//! 终端调用方（传输层或业务处理器）。

use std::future::Future;
use std::time::Duration;

use relay_errors::{RpcError, RpcResult};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    metadata: MetadataMap,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在当前时间基础上设置超时，已有更早的截止时间时保留原值
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 距截止时间的剩余时长
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// 派生子上下文：父上下文取消时子上下文一同取消，反之不影响父上下文
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            metadata: self.metadata.clone(),
        }
    }

    /// 调用已取消或已超时时返回对应的状态错误
    pub fn check_live(&self) -> RpcResult<()> {
        if self.is_cancelled() {
            return Err(RpcError::cancelled("call cancelled"));
        }
        if self.is_expired() {
            return Err(RpcError::deadline_exceeded("deadline exceeded"));
        }
        Ok(())
    }

    /// 在取消和截止时间约束下等待 `fut`，先触发的一方决定结果
    pub async fn guard<T, F>(&self, fut: F) -> RpcResult<T>
    where
        F: Future<Output = RpcResult<T>>,
    {
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RpcError::cancelled("call cancelled")),
            _ = expired => Err(RpcError::deadline_exceeded("deadline exceeded")),
            result = fut => result,
        }
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }
}
