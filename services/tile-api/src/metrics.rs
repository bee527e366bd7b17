//! Application metrics recorded through the `metrics` facade and exported
//! via the Prometheus endpoint.

use metrics::counter;

/// Record a served tile and how it was produced.
pub fn record_tile(kind: &'static str, outcome: &'static str) {
    counter!("tiles_served_total", "kind" => kind, "outcome" => outcome).increment(1);
}

/// Record a render-backend invocation result.
pub fn record_render(success: bool) {
    let outcome = if success { "ok" } else { "error" };
    counter!("render_backend_calls_total", "outcome" => outcome).increment(1);
}

/// Record a pre-render job unit completion.
pub fn record_prerender_tile(success: bool) {
    let outcome = if success { "ok" } else { "failed" };
    counter!("prerender_tiles_total", "outcome" => outcome).increment(1);
}

/// Record a masked-query execution (not a cache hit).
pub fn record_query(query_type: &str) {
    counter!("cube_queries_total", "query_type" => query_type.to_string()).increment(1);
}
