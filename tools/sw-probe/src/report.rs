//! Plain-text rendering of probe results.

use dashboard_net::Response;
use dashboard_sw::{PartitionStats, Route, ServiceWorkerEvent};

/// One row per partition.
pub fn stats_table(partitions: &[PartitionStats]) -> String {
    if partitions.is_empty() {
        return "  (no partitions)\n".to_string();
    }

    let width = partitions.iter().map(|p| p.name.len()).max().unwrap_or(0);
    let mut out = String::new();
    for p in partitions {
        let limit = match (p.max_entries, p.max_age_seconds) {
            (Some(entries), Some(age)) => format!("limit {entries} entries / {age}s"),
            _ => "stale generation".to_string(),
        };
        out.push_str(&format!(
            "  {:<width$}  {:>4} entries  {:>8} bytes  {}\n",
            p.name, p.entries, p.bytes, limit
        ));
    }
    out
}

/// Summary line for a fetch through the worker.
pub fn fetch_line(path: &str, route: Option<Route>, response: &Response) -> String {
    let source = if response.from_cache { "cache" } else { "network" };
    let route = match route {
        Some(route) => format!("{} / {}", route.role, route.strategy),
        None => "passthrough".to_string(),
    };
    format!(
        "  {path:<28} {} {:<7} [{route}] {} bytes",
        response.status.as_u16(),
        source,
        response.body.len()
    )
}

/// Human-readable lifecycle event.
pub fn event_line(event: &ServiceWorkerEvent) -> String {
    match event {
        ServiceWorkerEvent::UpdateFound { version } => format!("  updatefound       {version}"),
        ServiceWorkerEvent::StateChange {
            worker_id,
            version,
            new_state,
        } => format!("  statechange       {worker_id} {version} -> {new_state}"),
        ServiceWorkerEvent::ControllerChange {
            client_id,
            worker_id,
        } => format!("  controllerchange  {client_id} -> {worker_id}"),
        ServiceWorkerEvent::UpdateAvailable { version } => {
            format!("  update available  {version}")
        }
    }
}
