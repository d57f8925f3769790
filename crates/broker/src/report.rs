use serde_json::Value;

/// A successful guest report, split the way the worker's success path needs
/// it: the per-ticker `details` map is cached separately and stripped out of
/// what gets published on `backtest_updates`, so subscribers never receive
/// the (potentially large) per-ticker blobs.
pub struct SplitReport {
    pub details: Vec<(String, Value)>,
    pub metrics: Value,
    pub portfolio_summary: Value,
}

/// Pop `details` out of the guest's `report` object and separate the two
/// fields the `success` event carries. A `details` value that isn't a JSON
/// object (or is absent) yields no detail records, matching a strategy that
/// produced no per-ticker breakdown.
pub fn split_report(mut report: Value) -> SplitReport {
    let details = report
        .as_object_mut()
        .and_then(|obj| obj.remove("details"))
        .and_then(|v| v.as_object().cloned())
        .map(|obj| obj.into_iter().collect())
        .unwrap_or_default();

    let metrics = report.get("metrics").cloned().unwrap_or(Value::Array(Vec::new()));
    let portfolio_summary = report
        .get("portfolio_summary")
        .cloned()
        .unwrap_or(Value::Object(serde_json::Map::new()));

    SplitReport { details, metrics, portfolio_summary }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pops_details_and_keeps_metrics_and_summary() {
        let report = json!({
            "metrics": [1, 2, 3],
            "portfolio_summary": {"total_return": 0.42},
            "details": {
                "AAPL": {"price": [1, 2, 3]},
                "MSFT": {"price": [4, 5, 6]},
            }
        });

        let split = split_report(report);
        assert_eq!(split.metrics, json!([1, 2, 3]));
        assert_eq!(split.portfolio_summary, json!({"total_return": 0.42}));
        assert_eq!(split.details.len(), 2);
        assert!(split.details.iter().any(|(ticker, _)| ticker == "AAPL"));
    }

    #[test]
    fn missing_details_yields_empty_vec() {
        let report = json!({"metrics": [], "portfolio_summary": {}});
        let split = split_report(report);
        assert!(split.details.is_empty());
    }

    #[test]
    fn missing_metrics_and_summary_default_to_empty_array_and_object() {
        let split = split_report(json!({}));
        assert_eq!(split.metrics, json!([]));
        assert_eq!(split.portfolio_summary, json!({}));
    }
}
