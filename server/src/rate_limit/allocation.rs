//! Endpoint rate-limit allocation (spec.md §4.C "Endpoint allocations",
//! Invariant 3).

use std::collections::HashMap;

/// One endpoint's share of the adapter's total admitted rate, either set
/// explicitly in `rateLimiting.allocationPercentage` or computed by
/// splitting the remainder evenly among endpoints that didn't set one.
pub fn resolve_allocations(
    endpoint_names: &[String],
    explicit: &HashMap<String, f64>,
) -> anyhow::Result<HashMap<String, f64>> {
    let sum_explicit: f64 = explicit.values().sum();
    if sum_explicit > 100.0 + f64::EPSILON {
        anyhow::bail!(
            "endpoint allocationPercentage values sum to {sum_explicit}, which exceeds 100"
        );
    }

    let implicit: Vec<&String> = endpoint_names.iter().filter(|n| !explicit.contains_key(*n)).collect();

    if implicit.is_empty() && (sum_explicit - 100.0).abs() < f64::EPSILON {
        // every endpoint set an explicit share and they happen to sum to
        // exactly 100 — that's fine, nothing implicit to starve.
    }
    if !implicit.is_empty() && (sum_explicit - 100.0).abs() < f64::EPSILON {
        anyhow::bail!(
            "allocationPercentage values sum to exactly 100 but {} endpoint(s) have no explicit \
             share; they would receive 0% of the rate limit",
            implicit.len()
        );
    }

    let remainder = (100.0 - sum_explicit).max(0.0);
    let share_each = if implicit.is_empty() { 0.0 } else { remainder / implicit.len() as f64 };

    let mut out = HashMap::new();
    for name in endpoint_names {
        let pct = explicit.get(name).copied().unwrap_or(share_each);
        out.insert(name.clone(), pct);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_endpoints_split_the_remainder() {
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut explicit = HashMap::new();
        explicit.insert("a".to_string(), 40.0);
        let result = resolve_allocations(&names, &explicit).unwrap();
        assert_eq!(result["a"], 40.0);
        assert_eq!(result["b"], 30.0);
        assert_eq!(result["c"], 30.0);
    }

    #[test]
    fn explicit_sum_over_100_is_fatal() {
        let names = vec!["a".to_string(), "b".to_string()];
        let mut explicit = HashMap::new();
        explicit.insert("a".to_string(), 60.0);
        explicit.insert("b".to_string(), 50.0);
        assert!(resolve_allocations(&names, &explicit).is_err());
    }

    #[test]
    fn exactly_100_with_implicit_endpoint_is_fatal() {
        let names = vec!["a".to_string(), "b".to_string()];
        let mut explicit = HashMap::new();
        explicit.insert("a".to_string(), 100.0);
        assert!(resolve_allocations(&names, &explicit).is_err());
    }

    #[test]
    fn no_explicit_shares_splits_evenly() {
        let names = vec!["a".to_string(), "b".to_string()];
        let explicit = HashMap::new();
        let result = resolve_allocations(&names, &explicit).unwrap();
        assert_eq!(result["a"], 50.0);
        assert_eq!(result["b"], 50.0);
    }
}
