//! 方法标识与流描述

use std::borrow::Borrow;
use std::sync::Arc;

use derive_more::Display;

/// RPC 方法标识，例如 `/product.ProductService/GetProduct`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("{_0}")]
pub struct MethodName(Arc<str>);

impl MethodName {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 服务名部分；不是 `/service/method` 形式时返回完整字符串
    pub fn service(&self) -> &str {
        self.split().map(|(service, _)| service).unwrap_or(self.as_str())
    }

    /// 方法名部分；不是 `/service/method` 形式时返回完整字符串
    pub fn method(&self) -> &str {
        self.split().map(|(_, method)| method).unwrap_or(self.as_str())
    }

    fn split(&self) -> Option<(&str, &str)> {
        let rest = self.0.strip_prefix('/')?;
        let (service, method) = rest.split_once('/')?;
        if service.is_empty() || method.is_empty() || method.contains('/') {
            return None;
        }
        Some((service, method))
    }
}

impl From<&str> for MethodName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for MethodName {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl Borrow<str> for MethodName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for MethodName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// 流描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDesc {
    pub name: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

impl StreamDesc {
    /// 双向流
    pub fn bidirectional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_streaming: true,
            server_streaming: true,
        }
    }

    pub fn client_streaming(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_streaming: true,
            server_streaming: false,
        }
    }

    pub fn server_streaming(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_streaming: false,
            server_streaming: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_and_method_split() {
        let name = MethodName::new("/product.ProductService/GetProduct");
        assert_eq!(name.service(), "product.ProductService");
        assert_eq!(name.method(), "GetProduct");
        assert_eq!(name.to_string(), "/product.ProductService/GetProduct");
    }

    #[test]
    fn test_bare_name_falls_back_to_whole_string() {
        let name = MethodName::from("GetProduct");
        assert_eq!(name.service(), "GetProduct");
        assert_eq!(name.method(), "GetProduct");
    }

    #[test]
    fn test_clone_shares_storage() {
        let a = MethodName::new("/a/b");
        let b = a.clone();
        assert_eq!(a, b);
        assert!(std::ptr::eq(a.as_str(), b.as_str()));
    }
}
