//! Hostname resolution for the DNS check task.

use std::net::IpAddr;

use gkeship_core::Result;

#[async_trait::async_trait]
pub trait DnsResolver: Send + Sync {
    /// First IPv4 address for `host`, if it resolves.
    async fn lookup_v4(&self, host: &str) -> Result<Option<String>>;
}

/// Resolver backed by the system's name service.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait::async_trait]
impl DnsResolver for SystemResolver {
    async fn lookup_v4(&self, host: &str) -> Result<Option<String>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs
            .map(|a| a.ip())
            .find(IpAddr::is_ipv4)
            .map(|ip| ip.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_ipv4_literal() {
        assert_eq!(SystemResolver.lookup_v4("127.0.0.1").await.unwrap().as_deref(), Some("127.0.0.1"));
    }
}
