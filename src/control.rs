//! Control Plane Hooks (C9): the synchronous operations every control
//! surface (HTTP, CLI, tests) goes through, plus a thin `axum` HTTP shim
//! over them (spec §4.9/§6). The HTTP layer holds no business logic of its
//! own — it only serializes requests into calls on [`ControlPlane`] and
//! responses back out, mirroring how the original `ids/web/api.py` (Flask)
//! called straight into `IDS` methods.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::alert::Alert;
use crate::config::RuntimeConfig;
use crate::quarantine::QuarantineActuator;
use crate::rules::{parse_rule, RawRule, Rule, RuleEngine};
use crate::sink::InMemorySink;
use crate::stats::Stats;

/// Everything the control plane needs a handle to. Held behind `Arc` so
/// both the HTTP router and direct callers (tests, a future CLI) can share
/// one instance.
pub struct ControlPlane {
    pub rules: Arc<RuleEngine>,
    pub sink: Arc<InMemorySink>,
    pub quarantine: Arc<dyn QuarantineActuator>,
    pub stats: Arc<Stats>,
    pub config: parking_lot::RwLock<RuntimeConfig>,
}

impl ControlPlane {
    pub fn reload_rules(&self) -> crate::error::Result<()> {
        self.rules.reload()
    }

    pub fn add_rule(&self, rule: Rule) {
        self.rules.add(rule);
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        self.rules.remove(name)
    }

    pub fn enable_rule(&self, name: &str) -> bool {
        self.rules.enable(name)
    }

    pub fn disable_rule(&self, name: &str) -> bool {
        self.rules.disable(name)
    }

    pub fn get_config(&self) -> RuntimeConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, update: ConfigUpdate) {
        let mut config = self.config.write();
        if let Some(capacity) = update.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(workers) = update.worker_count {
            config.worker_count = workers;
        }
        if let Some(emit) = update.emit_on_every_match {
            config.emit_on_every_match = emit;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfigUpdate {
    pub queue_capacity: Option<usize>,
    pub worker_count: Option<usize>,
    pub emit_on_every_match: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct PagedAlerts {
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_per_page")]
    per_page: usize,
}

fn default_page() -> usize {
    1
}

fn default_per_page() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct SeverityHistogram {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
}

async fn list_alerts(State(state): State<Arc<ControlPlane>>, Query(q): Query<PageQuery>) -> Json<PagedAlerts> {
    let (total, alerts) = state.sink.recent_alerts(q.page, q.per_page);
    Json(PagedAlerts { total, page: q.page, per_page: q.per_page, alerts })
}

async fn severity_histogram(State(state): State<Arc<ControlPlane>>) -> Json<SeverityHistogram> {
    let mut histogram = SeverityHistogram { low: 0, medium: 0, high: 0, critical: 0 };
    for alert in state.sink.all_alerts() {
        match alert.severity {
            crate::rules::Severity::Low => histogram.low += 1,
            crate::rules::Severity::Medium => histogram.medium += 1,
            crate::rules::Severity::High => histogram.high += 1,
            crate::rules::Severity::Critical => histogram.critical += 1,
        }
    }
    Json(histogram)
}

async fn list_rules(State(state): State<Arc<ControlPlane>>) -> Json<Vec<String>> {
    Json(state.rules.rule_names())
}

/// Creates a new rule (spec §6 "list/create/update/delete rules").
async fn create_rule(State(state): State<Arc<ControlPlane>>, Json(raw): Json<RawRule>) -> StatusCode {
    match parse_rule(raw) {
        Ok(rule) => {
            state.add_rule(rule);
            StatusCode::CREATED
        }
        Err(_) => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

/// Replaces an existing rule's body by name; the path segment is
/// authoritative over whatever name the request body carries.
async fn update_rule(
    State(state): State<Arc<ControlPlane>>,
    Path(name): Path<String>,
    Json(raw): Json<RawRule>,
) -> StatusCode {
    match parse_rule(raw) {
        Ok(mut rule) => {
            rule.name = name;
            state.add_rule(rule);
            StatusCode::NO_CONTENT
        }
        Err(_) => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

#[derive(Debug, Serialize)]
pub struct TopTalker {
    pub ip: String,
    pub alert_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct TopTalkersQuery {
    #[serde(default = "default_top_talkers_limit")]
    limit: usize,
}

fn default_top_talkers_limit() -> usize {
    10
}

async fn top_talkers(
    State(state): State<Arc<ControlPlane>>,
    Query(q): Query<TopTalkersQuery>,
) -> Json<Vec<TopTalker>> {
    let talkers = state
        .sink
        .top_talkers(q.limit)
        .into_iter()
        .map(|(ip, alert_count)| TopTalker { ip: ip.to_string(), alert_count })
        .collect();
    Json(talkers)
}

async fn enable_rule(State(state): State<Arc<ControlPlane>>, Path(name): Path<String>) -> StatusCode {
    if state.enable_rule(&name) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn disable_rule(State(state): State<Arc<ControlPlane>>, Path(name): Path<String>) -> StatusCode {
    if state.disable_rule(&name) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn delete_rule(State(state): State<Arc<ControlPlane>>, Path(name): Path<String>) -> StatusCode {
    if state.remove_rule(&name) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn reload_rules(State(state): State<Arc<ControlPlane>>) -> StatusCode {
    match state.reload_rules() {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

async fn get_config(State(state): State<Arc<ControlPlane>>) -> Json<RuntimeConfig> {
    Json(state.get_config())
}

async fn update_config(State(state): State<Arc<ControlPlane>>, Json(update): Json<ConfigUpdate>) -> StatusCode {
    state.update_config(update);
    StatusCode::NO_CONTENT
}

async fn stats(State(state): State<Arc<ControlPlane>>) -> Json<StatsSnapshot> {
    Json(StatsSnapshot {
        packets_captured: state.stats.packets_captured.get(),
        queue_dropped: state.stats.queue_dropped.get(),
        eval_errors: state.stats.eval_errors.get(),
        sink_errors: state.stats.sink_errors.get(),
        alerts_emitted: state.stats.alerts_emitted.get(),
        correlation_alerts_emitted: state.stats.correlation_alerts_emitted.get(),
        bans_issued: state.stats.bans_issued.get(),
    })
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub packets_captured: u64,
    pub queue_dropped: u64,
    pub eval_errors: u64,
    pub sink_errors: u64,
    pub alerts_emitted: u64,
    pub correlation_alerts_emitted: u64,
    pub bans_issued: u64,
}

/// Builds the axum router, the small request surface spec §6 calls for.
pub fn router(state: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/alerts", get(list_alerts))
        .route("/alerts/severity-histogram", get(severity_histogram))
        .route("/stats/top-talkers", get(top_talkers))
        .route("/rules", get(list_rules).post(create_rule))
        .route("/rules/reload", post(reload_rules))
        .route("/rules/:name/enable", post(enable_rule))
        .route("/rules/:name/disable", post(disable_rule))
        .route("/rules/:name", axum::routing::delete(delete_rule).put(update_rule))
        .route("/config", get(get_config).post(update_config))
        .route("/stats", get(stats))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quarantine::NoopActuator;

    fn control_plane() -> Arc<ControlPlane> {
        Arc::new(ControlPlane {
            rules: Arc::new(RuleEngine::with_builtin_rules()),
            sink: Arc::new(InMemorySink::new(100)),
            quarantine: Arc::new(NoopActuator),
            stats: Arc::new(Stats::default()),
            config: parking_lot::RwLock::new(RuntimeConfig::default()),
        })
    }

    #[test]
    fn enable_disable_round_trip_through_control_plane() {
        let plane = control_plane();
        assert!(plane.disable_rule("Large Packet Detection"));
        assert!(!plane.rules.get("Large Packet Detection").unwrap().enabled);
        assert!(plane.enable_rule("Large Packet Detection"));
        assert!(plane.rules.get("Large Packet Detection").unwrap().enabled);
    }

    #[test]
    fn top_talkers_ranks_by_alert_count_descending() {
        use crate::alert::{Alert, AlertKind};
        use std::net::{IpAddr, Ipv4Addr};

        let plane = control_plane();
        let noisy = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let quiet = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let rule = plane.rules.get("Large Packet Detection").unwrap();

        for ip in [noisy, noisy, noisy, quiet] {
            let mut alert = Alert::from_rule(&rule, AlertKind::Rule);
            alert.src_ip = Some(ip);
            plane.sink.save_alert(uuid::Uuid::new_v4(), &[alert]).unwrap();
        }

        let ranked = plane.sink.top_talkers(10);
        assert_eq!(ranked[0], (noisy, 3));
        assert_eq!(ranked[1], (quiet, 1));
    }

    fn raw_ttl_rule(name: &str) -> RawRule {
        RawRule {
            name: name.to_string(),
            conditions: vec![("ip_ttl".to_string(), "<".to_string(), serde_yaml::Value::from(10))],
            severity: "low".to_string(),
            enabled: true,
            domain: None,
        }
    }

    #[tokio::test]
    async fn create_rule_handler_adds_a_parsed_rule() {
        let plane = control_plane();
        let status = create_rule(State(plane.clone()), Json(raw_ttl_rule("R"))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(plane.rules.get("R").is_some());
    }

    #[tokio::test]
    async fn create_rule_handler_rejects_unknown_feature() {
        let plane = control_plane();
        let mut raw = raw_ttl_rule("Bad");
        raw.conditions = vec![("not_a_feature".to_string(), "<".to_string(), serde_yaml::Value::from(10))];
        let status = create_rule(State(plane.clone()), Json(raw)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(plane.rules.get("Bad").is_none());
    }

    #[tokio::test]
    async fn update_rule_handler_replaces_conditions_under_the_path_name() {
        let plane = control_plane();
        create_rule(State(plane.clone()), Json(raw_ttl_rule("R"))).await;

        let mut raw = raw_ttl_rule("ignored-body-name");
        raw.severity = "high".to_string();
        let status = update_rule(State(plane.clone()), Path("R".to_string()), Json(raw)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let updated = plane.rules.get("R").unwrap();
        assert_eq!(updated.severity, crate::rules::Severity::High);
    }

    #[test]
    fn update_config_only_touches_supplied_fields() {
        let plane = control_plane();
        let before = plane.get_config();
        plane.update_config(ConfigUpdate { queue_capacity: Some(99), worker_count: None, emit_on_every_match: None });
        let after = plane.get_config();
        assert_eq!(after.queue_capacity, 99);
        assert_eq!(after.worker_count, before.worker_count);
    }
}
