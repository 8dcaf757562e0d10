//! TransportRouter (spec.md §4.F): per-endpoint named map of transports plus
//! the routing policy that picks one for an inbound request.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::AdapterError;
use crate::transport::Transport;

/// Sentinel name used when an endpoint registers exactly one transport and
/// doesn't care to name it (spec.md §4.F rule 1).
pub const DEFAULT_TRANSPORT_NAME: &str = "default";

static VALID_NAME: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-z]+$").unwrap());

/// User-supplied routing override consulted before the request's own
/// `data.transport` field (spec.md §4.F rule 2).
pub type CustomRouterFn = Arc<dyn Fn(&serde_json::Value) -> Option<String> + Send + Sync>;

pub struct TransportRouter {
    transports: HashMap<String, Arc<dyn Transport>>,
    /// Registration order, kept alongside the lookup map so error messages
    /// can list valid names the way they were registered (spec.md §8
    /// scenario S4) rather than in `HashMap` iteration order.
    names_in_order: Vec<String>,
    custom_router: Option<CustomRouterFn>,
    default_transport: Option<String>,
}

impl TransportRouter {
    /// Builds the map, enforcing Invariant 7: names match `^[a-z]+$` (or are
    /// the single default sentinel), and no two entries share a name.
    pub fn new(
        transports: Vec<(String, Arc<dyn Transport>)>,
        custom_router: Option<CustomRouterFn>,
        default_transport: Option<String>,
    ) -> anyhow::Result<Self> {
        let mut map = HashMap::new();
        let mut names_in_order = Vec::with_capacity(transports.len());
        let is_single_default = transports.len() == 1 && transports[0].0 == DEFAULT_TRANSPORT_NAME;

        for (name, transport) in transports {
            if !is_single_default && !VALID_NAME.is_match(&name) {
                anyhow::bail!("transport name {name:?} must match ^[a-z]+$");
            }
            if map.insert(name.clone(), transport).is_some() {
                anyhow::bail!("duplicate transport name {name:?} in transport routes map");
            }
            names_in_order.push(name);
        }

        Ok(Self { transports: map, names_in_order, custom_router, default_transport })
    }

    pub fn transports(&self) -> impl Iterator<Item = (&str, &Arc<dyn Transport>)> {
        self.transports.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Resolves the transport for one request (spec.md §4.F):
    /// 1. If exactly one transport is registered under the default sentinel, use it.
    /// 2. Else try `customRouter`, then `data.transport`, then `defaultTransport`, in that order.
    pub fn resolve(&self, data: &serde_json::Value) -> Result<Arc<dyn Transport>, AdapterError> {
        if self.transports.len() == 1 {
            if let Some(transport) = self.transports.get(DEFAULT_TRANSPORT_NAME) {
                return Ok(transport.clone());
            }
        }

        let requested = self
            .custom_router
            .as_ref()
            .and_then(|f| f(data))
            .or_else(|| data.get("transport").and_then(|v| v.as_str()).map(str::to_string))
            .or_else(|| self.default_transport.clone());

        let Some(name) = requested else {
            let valid: Vec<&str> = self.names_in_order.iter().map(String::as_str).collect();
            return Err(AdapterError::Input(format!(
                "no transport specified and no default transport configured, must be one of {valid:?}"
            )));
        };

        let name = name.to_lowercase();
        self.transports.get(&name).cloned().ok_or_else(|| {
            let valid: Vec<&str> = self.names_in_order.iter().map(String::as_str).collect();
            AdapterError::Input(format!("No transport found for key {name:?}, must be one of {valid:?}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubTransport(&'static str);

    #[async_trait]
    impl Transport for StubTransport {
        fn name(&self) -> &str {
            self.0
        }
        async fn background_execute(&self) -> Result<(), AdapterError> {
            Ok(())
        }
        fn min_period(&self) -> std::time::Duration {
            std::time::Duration::from_secs(1)
        }
    }

    fn stub(name: &'static str) -> (String, Arc<dyn Transport>) {
        (name.to_string(), Arc::new(StubTransport(name)))
    }

    #[test]
    fn unknown_transport_name_yields_s4_message() {
        let router = TransportRouter::new(vec![stub("websocket"), stub("batch"), stub("sse")], None, None).unwrap();
        let data = serde_json::json!({"transport": "qweqwe"});
        let err = router.resolve(&data).unwrap_err();
        let message = err.to_string();
        assert_eq!(
            message,
            "No transport found for key \"qweqwe\", must be one of [\"websocket\", \"batch\", \"sse\"]"
        );
    }

    #[test]
    fn single_default_sentinel_short_circuits() {
        let router = TransportRouter::new(vec![stub(DEFAULT_TRANSPORT_NAME)], None, None).unwrap();
        let data = serde_json::json!({});
        assert!(router.resolve(&data).is_ok());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = TransportRouter::new(vec![stub("batch"), stub("batch")], None, None);
        assert!(result.is_err());
    }

    #[test]
    fn invalid_name_shape_is_rejected() {
        let result = TransportRouter::new(vec![("Batch-1".to_string(), Arc::new(StubTransport("x")))], None, None);
        assert!(result.is_err());
    }
}
