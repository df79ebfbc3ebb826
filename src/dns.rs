//! DNS resolution is a collaborator: the engine asks an injected [`Resolve`]
//! for addresses and never caches or re-orders beyond the route planner's
//! failed-route penalty.

use std::{fmt, future::Future, net::IpAddr, pin::Pin, sync::Arc};

use crate::error::BoxError;

/// A domain name to resolve into IP addresses.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    /// Creates a new [`Name`] from a string slice.
    #[inline]
    pub fn new(host: Box<str>) -> Name {
        Name { host }
    }

    /// View the hostname as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value.into())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// Alias for the `Future` type returned by a DNS resolver.
pub type Resolving = Pin<Box<dyn Future<Output = Result<Vec<IpAddr>, BoxError>> + Send>>;

/// Trait for customizing DNS resolution.
pub trait Resolve: Send + Sync {
    /// Performs DNS resolution on a `Name`.
    ///
    /// The returned addresses keep provider order; the route planner
    /// preserves that order except for routes recently seen to fail.
    ///
    /// It differs from a `tower`-style service in several ways:
    ///  * It is assumed that `resolve` will always be ready to poll.
    ///  * It does not need a mutable reference to `self`.
    ///  * Since trait objects cannot make use of associated types, it
    ///    requires wrapping the returned `Future` with `Box`.
    fn resolve(&self, name: Name) -> Resolving;
}

/// The default resolver: the operating system's, via `getaddrinfo` on a
/// blocking-friendly tokio lookup.
pub(crate) struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            // Port 0 is discarded; the planner re-applies the address port.
            let addrs = tokio::net::lookup_host((name.as_str(), 0))
                .await
                .map_err(|e| Box::new(e) as BoxError)?
                .map(|sa| sa.ip())
                .collect::<Vec<_>>();
            if addrs.is_empty() {
                return Err(format!("no addresses for {name}").into());
            }
            Ok(addrs)
        })
    }
}

impl fmt::Debug for SystemResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SystemResolver")
    }
}

/// DNS resolver that serves fixed answers before falling back.
///
/// Useful for tests and for bypassing DNS for specific hosts.
pub struct StaticResolver {
    fallback: Option<Arc<dyn Resolve>>,
    overrides: std::collections::HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    /// A resolver with no fallback: unknown hosts fail.
    pub fn new() -> StaticResolver {
        StaticResolver {
            fallback: None,
            overrides: Default::default(),
        }
    }

    /// Answer `host` with `addrs`, in order.
    pub fn insert(mut self, host: &str, addrs: Vec<IpAddr>) -> StaticResolver {
        self.overrides.insert(host.to_string(), addrs);
        self
    }

    /// Delegate unknown hosts to `fallback`.
    pub fn with_fallback(mut self, fallback: Arc<dyn Resolve>) -> StaticResolver {
        self.fallback = Some(fallback);
        self
    }
}

impl Default for StaticResolver {
    fn default() -> Self {
        StaticResolver::new()
    }
}

impl fmt::Debug for StaticResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticResolver")
            .field("overrides", &self.overrides)
            .finish()
    }
}

impl Resolve for StaticResolver {
    fn resolve(&self, name: Name) -> Resolving {
        match self.overrides.get(name.as_str()) {
            Some(addrs) => {
                let addrs = addrs.clone();
                Box::pin(std::future::ready(Ok(addrs)))
            }
            None => match &self.fallback {
                Some(fallback) => fallback.resolve(name),
                None => Box::pin(std::future::ready(Err(format!(
                    "no static answer for {name}"
                )
                .into()))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_answers_in_order() {
        let resolver = StaticResolver::new().insert(
            "h.example",
            vec!["2001:db8::1".parse().unwrap(), "198.51.100.7".parse().unwrap()],
        );

        let addrs = resolver.resolve(Name::from("h.example")).await.unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].is_ipv6());
        assert!(addrs[1].is_ipv4());
    }

    #[tokio::test]
    async fn static_resolver_unknown_host_fails() {
        let resolver = StaticResolver::new();
        assert!(resolver.resolve(Name::from("nope.example")).await.is_err());
    }
}
