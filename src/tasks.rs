//! Built-in tasks registered by the `hq` binary.

use serde_json::json;

use crate::registry::TaskRegistry;
use crate::types::{SchedulerError, TaskParams};

/// Register the built-in task set on `registry`.
pub fn register_builtin(registry: &mut TaskRegistry) -> Result<(), SchedulerError> {
    registry.register(
        "ping",
        "Website Health Check",
        Some("Fetch a URL and report its status code and response headers"),
        ping,
    )?;
    registry.register(
        "process_data",
        "Data Processing",
        Some("Simulate batch processing of an input path"),
        process_data,
    )?;
    Ok(())
}

fn require_str<'a>(params: &'a TaskParams, key: &str) -> anyhow::Result<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing required string parameter '{key}'"))
}

async fn ping(params: TaskParams) -> anyhow::Result<serde_json::Value> {
    let url = require_str(&params, "url")?.to_string();
    let response = reqwest::get(&url).await?;
    let status = response.status().as_u16();
    let headers: serde_json::Map<String, serde_json::Value> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), json!(v)))
        })
        .collect();
    Ok(json!({ "status": status, "headers": headers }))
}

async fn process_data(params: TaskParams) -> anyhow::Result<serde_json::Value> {
    let input_path = require_str(&params, "input_path")?.to_string();
    let batch_size = params
        .get("batch_size")
        .and_then(|v| v.as_u64())
        .unwrap_or(100);

    // Stand-in workload.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    Ok(json!({
        "processed_records": batch_size,
        "input_path": input_path,
    }))
}
