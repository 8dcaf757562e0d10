//! Endpoint (spec.md §4.G): input validation, request transforms, override
//! application, and the transport router it owns.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::AdapterError;
use crate::router::TransportRouter;

/// Applied in order before cache-key derivation (spec.md §4.G):
/// `symbolOverrider` always runs first, then any user-supplied transforms.
pub type RequestTransformFn = Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;

/// Returning `Some(err)` short-circuits the request with that error.
pub type CustomValidationFn = Arc<dyn Fn(&serde_json::Value) -> Option<AdapterError> + Send + Sync>;

pub struct Endpoint {
    pub name: String,
    pub aliases: Vec<String>,
    pub router: TransportRouter,
    /// Static `overrides[base] = replacement`, consulted when the request
    /// doesn't carry its own `data.overrides[adapterName][base]`.
    pub overrides: HashMap<String, String>,
    pub request_transforms: Vec<RequestTransformFn>,
    pub custom_input_validation: Option<CustomValidationFn>,
}

impl Endpoint {
    /// All names this endpoint should be reachable under, lowercased
    /// (spec.md §3 "Names/aliases are lowercased").
    pub fn routing_names(&self) -> Vec<String> {
        let mut names: Vec<String> = vec![self.name.to_lowercase()];
        names.extend(self.aliases.iter().map(|a| a.to_lowercase()));
        names
    }

    /// Applies the built-in symbol-overrider, then user transforms, then
    /// runs custom input validation. Returns the transformed `data` ready
    /// for cache-key derivation.
    pub fn prepare_request(&self, adapter_name: &str, mut data: serde_json::Value) -> Result<serde_json::Value, AdapterError> {
        data = self.apply_symbol_overrider(adapter_name, data);
        for transform in &self.request_transforms {
            data = transform(data);
        }
        if let Some(validate) = &self.custom_input_validation {
            if let Some(err) = validate(&data) {
                return Err(err);
            }
        }
        Ok(data)
    }

    /// Built-in transform (spec.md §4.G step 1): the request's own
    /// per-adapter override table wins over this endpoint's static table.
    fn apply_symbol_overrider(&self, adapter_name: &str, mut data: serde_json::Value) -> serde_json::Value {
        let Some(base) = data.get("base").and_then(|v| v.as_str()).map(str::to_string) else {
            return data;
        };

        let request_override = data
            .get("overrides")
            .and_then(|o| o.get(adapter_name.to_lowercase()))
            .and_then(|a| a.get(&base))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let replacement = request_override.or_else(|| self.overrides.get(&base).cloned());

        if let Some(replacement) = replacement {
            if let Some(obj) = data.as_object_mut() {
                obj.insert("base".to_string(), serde_json::Value::String(replacement));
            }
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubTransport;

    #[async_trait]
    impl crate::transport::Transport for StubTransport {
        fn name(&self) -> &str {
            "default"
        }
        async fn background_execute(&self) -> Result<(), AdapterError> {
            Ok(())
        }
        fn min_period(&self) -> std::time::Duration {
            std::time::Duration::from_secs(1)
        }
    }

    fn endpoint_with_override() -> Endpoint {
        let router = TransportRouter::new(
            vec![(crate::router::DEFAULT_TRANSPORT_NAME.to_string(), Arc::new(StubTransport) as Arc<dyn crate::transport::Transport>)],
            None,
            None,
        )
        .unwrap();
        let mut overrides = HashMap::new();
        overrides.insert("WBTC".to_string(), "BTC".to_string());
        Endpoint {
            name: "price".to_string(),
            aliases: vec![],
            router,
            overrides,
            request_transforms: vec![],
            custom_input_validation: None,
        }
    }

    #[test]
    fn s5_static_override_normalizes_base() {
        let endpoint = endpoint_with_override();
        let data = serde_json::json!({"base": "WBTC", "quote": "USD"});
        let transformed = endpoint.prepare_request("TEST", data).unwrap();
        assert_eq!(transformed["base"], "BTC");
    }

    #[test]
    fn request_supplied_override_wins_over_static() {
        let endpoint = endpoint_with_override();
        let data = serde_json::json!({
            "base": "WBTC",
            "quote": "USD",
            "overrides": {"test": {"WBTC": "TBTC"}},
        });
        let transformed = endpoint.prepare_request("TEST", data).unwrap();
        assert_eq!(transformed["base"], "TBTC");
    }

    #[test]
    fn custom_validation_short_circuits() {
        let mut endpoint = endpoint_with_override();
        endpoint.custom_input_validation = Some(Arc::new(|data| {
            if data.get("quote").is_none() {
                Some(AdapterError::Input("missing quote".into()))
            } else {
                None
            }
        }));
        let data = serde_json::json!({"base": "ETH"});
        let result = endpoint.prepare_request("TEST", data);
        assert!(matches!(result, Err(AdapterError::Input(_))));
    }
}
