//! Backend selection by host and decoded block height.
//!
//! Three variants share one entry point, [`ProxyRouter::proxy_for_request`]:
//! plain host routing, pruning-or-default routing, and shard routing on top
//! of pruning-or-default. The variant is fixed at startup from configuration.
//! Decode and height errors never fail routing; they fall back to the
//! host's default backend.

pub mod shard;

use std::collections::HashMap;

use anyhow::Result;
use tracing::debug;

use crate::config::RoutingConfig;
use crate::rpc::height::{MethodClass, block_number_param, classify, needs_no_history};
use crate::rpc::types::JsonRpcRequest;
use shard::{ShardInterval, ShardIntervalTable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    /// Logical name, e.g. `default`, `pruning` or `shard-10`.
    pub name: String,
    pub url: String,
}

impl BackendTarget {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Exact host to default backend map.
#[derive(Debug, Clone, Default)]
pub struct HostRouter {
    defaults: HashMap<String, BackendTarget>,
}

impl HostRouter {
    pub fn new(defaults: &HashMap<String, String>) -> Self {
        Self {
            defaults: defaults
                .iter()
                .map(|(host, url)| (host.clone(), BackendTarget::new("default", url.clone())))
                .collect(),
        }
    }

    pub fn proxy_for_host(&self, host: &str) -> Option<&BackendTarget> {
        self.defaults.get(host)
    }
}

/// Where a request goes before shards are considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeightRoute {
    Pruning,
    Default,
    /// Concrete block number above zero.
    Height(u64),
}

fn height_route(req: &JsonRpcRequest) -> HeightRoute {
    if needs_no_history(&req.method) {
        return HeightRoute::Pruning;
    }
    match classify(&req.method) {
        MethodClass::BlockNumber(_) => match block_number_param(req) {
            Ok(height) if height.is_tip() => HeightRoute::Pruning,
            Ok(height) if height.is_concrete_positive() => HeightRoute::Height(height.0 as u64),
            Ok(_) => HeightRoute::Default,
            Err(e) => {
                debug!(method = %req.method, error = %e, "height not parsed, routing to default");
                HeightRoute::Default
            }
        },
        _ => HeightRoute::Default,
    }
}

/// Sends tip-of-chain traffic to a pruning backend and everything that may
/// need history to the default backend.
#[derive(Debug, Clone, Default)]
pub struct PruningRouter {
    hosts: HostRouter,
    pruning: HashMap<String, BackendTarget>,
}

impl PruningRouter {
    pub fn new(defaults: &HashMap<String, String>, pruning: &HashMap<String, String>) -> Self {
        Self {
            hosts: HostRouter::new(defaults),
            pruning: pruning
                .iter()
                .map(|(host, url)| (host.clone(), BackendTarget::new("pruning", url.clone())))
                .collect(),
        }
    }

    fn route(&self, host: &str, req: Option<&JsonRpcRequest>) -> (Option<&BackendTarget>, Option<u64>) {
        let default = self.hosts.proxy_for_host(host);
        let Some(req) = req else {
            return (default, None);
        };
        match height_route(req) {
            HeightRoute::Pruning => (self.pruning.get(host).or(default), None),
            HeightRoute::Default => (default, None),
            HeightRoute::Height(h) => (default, Some(h)),
        }
    }

    pub fn proxy_for_request(
        &self,
        host: &str,
        req: Option<&JsonRpcRequest>,
    ) -> Option<&BackendTarget> {
        self.route(host, req).0
    }
}

/// Pruning-or-default routing where concrete heights inside a configured
/// shard interval go to that shard.
#[derive(Debug, Clone, Default)]
pub struct ShardRouter {
    inner: PruningRouter,
    shards: HashMap<String, ShardIntervalTable>,
}

impl ShardRouter {
    pub fn new(inner: PruningRouter, shards: HashMap<String, ShardIntervalTable>) -> Self {
        Self { inner, shards }
    }

    pub fn proxy_for_request(
        &self,
        host: &str,
        req: Option<&JsonRpcRequest>,
    ) -> Option<&BackendTarget> {
        let (target, height) = self.inner.route(host, req);
        let target = target?;
        let Some(height) = height else {
            return Some(target);
        };
        match self.shards.get(host).and_then(|t| t.lookup(height)) {
            Some(shard) => Some(&shard.target),
            None => Some(target),
        }
    }
}

/// The configured routing strategy.
#[derive(Debug, Clone)]
pub enum ProxyRouter {
    Host(HostRouter),
    Pruning(PruningRouter),
    Shard(ShardRouter),
}

impl ProxyRouter {
    pub fn from_config(config: &RoutingConfig) -> Result<Self> {
        if !config.height_based {
            return Ok(Self::Host(HostRouter::new(&config.default_backends)));
        }
        let pruning = PruningRouter::new(&config.default_backends, &config.pruning_backends);
        if !config.sharded {
            return Ok(Self::Pruning(pruning));
        }

        let mut shards = HashMap::new();
        for (host, intervals) in &config.shards {
            let intervals = intervals
                .iter()
                .map(|s| ShardInterval {
                    end: s.end,
                    target: BackendTarget::new(format!("shard-{}", s.end), s.url.clone()),
                })
                .collect();
            shards.insert(host.clone(), ShardIntervalTable::new(intervals)?);
        }
        Ok(Self::Shard(ShardRouter::new(pruning, shards)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Host(_) => "host",
            Self::Pruning(_) => "pruning",
            Self::Shard(_) => "shard",
        }
    }

    /// Pick the backend for a request; `None` when the host is not configured.
    pub fn proxy_for_request(
        &self,
        host: &str,
        req: Option<&JsonRpcRequest>,
    ) -> Option<&BackendTarget> {
        let target = match self {
            Self::Host(r) => r.proxy_for_host(host),
            Self::Pruning(r) => r.proxy_for_request(host, req),
            Self::Shard(r) => r.proxy_for_request(host, req),
        };
        if let (Some(target), Some(req)) = (target, req) {
            debug!(host = %host, method = %req.method, backend = %target.name, "routed request");
        }
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardConfig;
    use serde_json::{Value, json};

    const HOST: &str = "rpc.local";

    fn routing(height_based: bool, sharded: bool, with_pruning: bool) -> RoutingConfig {
        let mut config = RoutingConfig {
            height_based,
            sharded,
            ..Default::default()
        };
        config
            .default_backends
            .insert(HOST.to_string(), "http://archive:8545".to_string());
        if with_pruning {
            config
                .pruning_backends
                .insert(HOST.to_string(), "http://pruning:8545".to_string());
        }
        config.shards.insert(
            HOST.to_string(),
            vec![
                ShardConfig {
                    end: 10,
                    url: "http://shard-a:8545".to_string(),
                },
                ShardConfig {
                    end: 20,
                    url: "http://shard-b:8545".to_string(),
                },
            ],
        );
        config
    }

    fn req(method: &str, params: Vec<Value>) -> JsonRpcRequest {
        JsonRpcRequest::new(json!(1), method, params)
    }

    fn route_name(router: &ProxyRouter, req: Option<&JsonRpcRequest>) -> Option<String> {
        router
            .proxy_for_request(HOST, req)
            .map(|t| t.name.clone())
    }

    #[test]
    fn test_kind_follows_config_shape() {
        assert_eq!(ProxyRouter::from_config(&routing(false, false, true)).unwrap().kind(), "host");
        assert_eq!(ProxyRouter::from_config(&routing(true, false, true)).unwrap().kind(), "pruning");
        assert_eq!(ProxyRouter::from_config(&routing(true, true, true)).unwrap().kind(), "shard");
    }

    #[test]
    fn test_unknown_host_not_found() {
        let router = ProxyRouter::from_config(&routing(true, true, true)).unwrap();
        let r = req("eth_blockNumber", vec![]);
        assert!(router.proxy_for_request("other.local", Some(&r)).is_none());
    }

    #[test]
    fn test_host_router_ignores_height() {
        let router = ProxyRouter::from_config(&routing(false, false, true)).unwrap();
        let r = req("eth_getBlockByNumber", vec![json!("latest"), json!(false)]);
        assert_eq!(route_name(&router, Some(&r)).unwrap(), "default");
    }

    #[test]
    fn test_pruning_router_tags_go_to_pruning() {
        let router = ProxyRouter::from_config(&routing(true, false, true)).unwrap();
        for tag in ["latest", "pending", "finalized", "safe"] {
            let r = req("eth_getBlockByNumber", vec![json!(tag), json!(false)]);
            assert_eq!(route_name(&router, Some(&r)).unwrap(), "pruning", "tag {tag}");
        }
        let r = req("eth_getBalance", vec![json!("0xabc")]);
        assert_eq!(route_name(&router, Some(&r)).unwrap(), "pruning");
    }

    #[test]
    fn test_pruning_router_history_goes_to_default() {
        let router = ProxyRouter::from_config(&routing(true, false, true)).unwrap();
        let cases = [
            req("eth_getBlockByNumber", vec![json!("0x5"), json!(false)]),
            req("eth_getBlockByNumber", vec![json!("earliest"), json!(false)]),
            req("eth_getBlockByNumber", vec![json!("nonsense"), json!(false)]),
            req("eth_getBlockByHash", vec![json!("0xabc"), json!(false)]),
            req("eth_getLogs", vec![json!({"fromBlock": "0x1"})]),
        ];
        for r in &cases {
            assert_eq!(route_name(&router, Some(r)).unwrap(), "default", "{}", r.method);
        }
    }

    #[test]
    fn test_pruning_router_no_history_methods() {
        let router = ProxyRouter::from_config(&routing(true, false, true)).unwrap();
        for method in ["eth_chainId", "eth_sendRawTransaction", "eth_blockNumber"] {
            let r = req(method, vec![]);
            assert_eq!(route_name(&router, Some(&r)).unwrap(), "pruning", "{method}");
        }
    }

    #[test]
    fn test_pruning_router_without_pruning_host_acts_like_host_router() {
        let router = ProxyRouter::from_config(&routing(true, false, false)).unwrap();
        let r = req("eth_getBlockByNumber", vec![json!("latest"), json!(false)]);
        assert_eq!(route_name(&router, Some(&r)).unwrap(), "default");
    }

    #[test]
    fn test_undecoded_request_goes_to_default() {
        let router = ProxyRouter::from_config(&routing(true, true, true)).unwrap();
        assert_eq!(route_name(&router, None).unwrap(), "default");
    }

    #[test]
    fn test_shard_router_uses_interval() {
        let router = ProxyRouter::from_config(&routing(true, true, true)).unwrap();
        let r = req("eth_getBlockByNumber", vec![json!("0x5"), json!(false)]);
        assert_eq!(route_name(&router, Some(&r)).unwrap(), "shard-10");
        let r = req("eth_getBalance", vec![json!("0xabc"), json!("0x14")]);
        assert_eq!(route_name(&router, Some(&r)).unwrap(), "shard-20");
    }

    #[test]
    fn test_shard_router_beyond_shards_goes_to_default() {
        let router = ProxyRouter::from_config(&routing(true, true, true)).unwrap();
        let r = req("eth_getBlockByNumber", vec![json!(21), json!(false)]);
        assert_eq!(route_name(&router, Some(&r)).unwrap(), "default");
    }

    #[test]
    fn test_shard_router_keeps_latest_on_pruning() {
        let router = ProxyRouter::from_config(&routing(true, true, true)).unwrap();
        let r = req("eth_getBlockByNumber", vec![json!("latest"), json!(false)]);
        assert_eq!(route_name(&router, Some(&r)).unwrap(), "pruning");
    }
}
