use crate::config::{AGGREGATE_ARRAY, AGGREGATE_MERGE};
use crate::error::{map_upstream_error, JsonError, ERROR_CODE_INTERNAL};
use crate::upstream::UpstreamResponse;
use bytes::Bytes;
use std::collections::HashSet;
use tracing::{error, warn};

/// Result of combining the upstream responses of one dispatch.
///
/// `data` is raw JSON (or `None` when the aggregate collapsed), `errors`
/// carries the deduplicated per-upstream failures, and `partial` marks a
/// response that has both data and errors.
#[derive(Debug, Default)]
pub struct AggregatedResponse {
    pub data: Option<Bytes>,
    pub errors: Vec<JsonError>,
    pub partial: bool,
}

/// Combine upstream responses under the route's strategy. An unknown
/// strategy is a configuration error and yields an empty aggregate.
pub fn aggregate(
    responses: &[UpstreamResponse],
    mode: &str,
    allow_partial_results: bool,
) -> AggregatedResponse {
    match mode {
        AGGREGATE_MERGE => merge(responses, allow_partial_results),
        AGGREGATE_ARRAY => array(responses, allow_partial_results),
        other => {
            error!("aggregate: unknown strategy, strategy={}", other);
            AggregatedResponse::default()
        }
    }
}

/// Shallow union of the JSON objects returned by the upstreams. On key
/// collision the later upstream (higher route index) wins.
fn merge(responses: &[UpstreamResponse], allow_partial_results: bool) -> AggregatedResponse {
    let mut merged = serde_json::Map::new();
    let mut errors: Vec<JsonError> = Vec::new();

    for resp in responses {
        let Some(body) = &resp.body else {
            continue;
        };

        if let Some(err) = &resp.err {
            if !allow_partial_results {
                return internal_aggregation_error();
            }
            errors.push(map_upstream_error(err));
            warn!(
                "aggregate: upstream failed, allow_partial_results={}, error={}",
                allow_partial_results, err
            );
            continue;
        }

        let obj: serde_json::Map<String, serde_json::Value> = match serde_json::from_slice(body) {
            Ok(obj) => obj,
            Err(e) => {
                if !allow_partial_results {
                    return internal_aggregation_error();
                }
                errors.push(JsonError::new(ERROR_CODE_INTERNAL, "internal error"));
                warn!(
                    "aggregate: cannot decode upstream body, allow_partial_results={}, error={}",
                    allow_partial_results, e
                );
                continue;
            }
        };

        for (key, value) in obj {
            merged.insert(key, value);
        }
    }

    let data = match serde_json::to_vec(&merged) {
        Ok(data) => Bytes::from(data),
        Err(_) => return internal_aggregation_error(),
    };

    let partial = !errors.is_empty();
    AggregatedResponse {
        data: Some(data),
        errors: dedupe_errors(errors),
        partial,
    }
}

/// JSON array of the upstream bodies as opaque raw values, in route order.
/// Bodies are embedded byte-for-byte; no validation happens in this mode.
fn array(responses: &[UpstreamResponse], allow_partial_results: bool) -> AggregatedResponse {
    let mut bodies: Vec<&Bytes> = Vec::with_capacity(responses.len());
    let mut errors: Vec<JsonError> = Vec::new();

    for resp in responses {
        let Some(body) = &resp.body else {
            continue;
        };

        if let Some(err) = &resp.err {
            if !allow_partial_results {
                return internal_aggregation_error();
            }
            errors.push(map_upstream_error(err));
            warn!(
                "aggregate: upstream failed, allow_partial_results={}, error={}",
                allow_partial_results, err
            );
            continue;
        }

        bodies.push(body);
    }

    let total: usize = bodies.iter().map(|b| b.len()).sum();
    let mut data = Vec::with_capacity(total + bodies.len() + 1);
    data.push(b'[');
    for (i, body) in bodies.iter().enumerate() {
        if i > 0 {
            data.push(b',');
        }
        data.extend_from_slice(body);
    }
    data.push(b']');

    let partial = !errors.is_empty();
    AggregatedResponse {
        data: Some(Bytes::from(data)),
        errors: dedupe_errors(errors),
        partial,
    }
}

fn internal_aggregation_error() -> AggregatedResponse {
    AggregatedResponse {
        data: None,
        errors: vec![JsonError::new(ERROR_CODE_INTERNAL, "internal error")],
        partial: false,
    }
}

/// Keep the first occurrence of every error code.
fn dedupe_errors(errors: Vec<JsonError>) -> Vec<JsonError> {
    let mut seen: HashSet<&'static str> = HashSet::new();
    errors
        .into_iter()
        .filter(|e| seen.insert(e.code))
        .collect()
}
