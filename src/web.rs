//! JSON API behind the dashboard.
//!
//! Endpoints:
//!   GET  /api/devices                → selectable sensors, actuators and operators
//!   GET  /api/clock                  → server time (when a clock widget is configured)
//!   GET  /api/{control_id}/config    → current rule
//!   POST /api/{control_id}/config    → replace rule (full body required)
//!   POST /api/{control_id}/manual    → one-off override `{device_id, action}`
//!   GET  /api/{sensor_id}/sensor_data → latest values and recent history
//!   GET  /api/{device_id}/status     → latest state and recent switches
//!   POST /api/{device_id}/control    → switch `{action}`
//!
//! Store and device failures are reported as `{"status": "error"}` bodies;
//! the underlying error only goes to the log.

use crate::devices::registry::{DeviceRegistry, DeviceSummary};
use crate::services::control::{Control, OPERATORS, manual_control};
use crate::services::readings::ReadingStore;
use crate::services::rules::RuleUpdate;
use crate::utils::history_start;
use chrono::{Local, Utc};
use log::{error, info, warn};
use rouille::{Request, Response, router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::net::SocketAddr;
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

pub struct AppState {
    pub controls: HashMap<String, Control>,
    pub registry: Arc<DeviceRegistry>,
    pub readings: ReadingStore,
    pub history_hours: u32,
    pub clock: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ManualRequest {
    device_id: String,
    action: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ControlRequest {
    action: String,
}

#[derive(Debug, Serialize)]
struct DeviceOptions<'a> {
    sensors: Vec<DeviceSummary>,
    actuators: Vec<DeviceSummary>,
    operators: &'a [&'a str],
}

/// The API server running on its own thread.
pub struct WebServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
    stop: mpsc::Sender<()>,
}

impl WebServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting requests and wait for the server thread to return.
    pub fn stop(self) -> Result<(), String> {
        // Fails only if the server thread is already gone.
        let _ = self.stop.send(());
        self.handle
            .join()
            .map_err(|_| "HTTP server thread panicked".to_string())?;
        info!("HTTP server on {} stopped", self.addr);
        Ok(())
    }
}

pub fn serve(state: AppState, bind: &str) -> Result<WebServer, String> {
    let server = rouille::Server::new(bind, move |request| {
        rouille::log_custom(request, log_ok, log_err, || handle(&state, request))
    })
    .map_err(|e| format!("failed to bind {}: {}", bind, e))?;
    let addr = server.server_addr();
    info!("Listening on http://{}", addr);
    let (handle, stop) = server.stoppable();
    Ok(WebServer { addr, handle, stop })
}

fn log_ok(request: &Request, response: &Response, elapsed: Duration) {
    info!(
        "{} {} -> {} ({} ms)",
        request.method(),
        request.raw_url(),
        response.status_code,
        elapsed.as_millis()
    );
}

fn log_err(request: &Request, elapsed: Duration) {
    error!(
        "{} {} panicked after {} ms",
        request.method(),
        request.raw_url(),
        elapsed.as_millis()
    );
}

pub fn handle(state: &AppState, request: &Request) -> Response {
    router!(request,
        (GET) (/api/devices) => { device_options(state) },
        (GET) (/api/clock) => {
            if state.clock { clock() } else { not_found() }
        },
        (GET) (/api/{control_id: String}/config) => { get_config(state, &control_id) },
        (POST) (/api/{control_id: String}/config) => { update_config(state, &control_id, request) },
        (POST) (/api/{control_id: String}/manual) => { manual(state, &control_id, request) },
        (GET) (/api/{sensor_id: String}/sensor_data) => { sensor_data(state, &sensor_id) },
        (GET) (/api/{device_id: String}/status) => { device_status(state, &device_id) },
        (POST) (/api/{device_id: String}/control) => { device_control(state, &device_id, request) },
        _ => not_found()
    )
}

fn error_response(status: u16, message: &str) -> Response {
    Response::json(&json!({ "status": "error", "message": message })).with_status_code(status)
}

fn not_found() -> Response {
    error_response(404, "not found")
}

/// Store failures are retryable; they are reported in the body, not as an HTTP fault.
fn storage_unavailable() -> Response {
    error_response(200, "storage unavailable")
}

fn read_json<T: for<'de> Deserialize<'de> + Default>(request: &Request) -> Result<T, String> {
    let Some(mut body) = request.data() else {
        return Ok(T::default());
    };
    let mut raw = Vec::new();
    body.read_to_end(&mut raw).map_err(|e| e.to_string())?;
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&raw).map_err(|e| e.to_string())
}

fn device_options(state: &AppState) -> Response {
    Response::json(&DeviceOptions {
        sensors: state.registry.list_sensors().iter().map(|d| d.summary()).collect(),
        actuators: state.registry.list_actuators().iter().map(|d| d.summary()).collect(),
        operators: &OPERATORS,
    })
}

fn clock() -> Response {
    let now = Local::now();
    Response::json(&json!({
        "ts": now.timestamp_millis() as f64 / 1000.0,
        "datetime": now.format("%Y-%m-%d %H:%M:%S").to_string(),
    }))
}

fn get_config(state: &AppState, control_id: &str) -> Response {
    let Some(control) = state.controls.get(control_id) else {
        return not_found();
    };
    match control.rule() {
        Ok(rule) => Response::json(&rule),
        Err(e) => {
            error!("[{}] Loading config failed: {}", control_id, e);
            storage_unavailable()
        }
    }
}

fn update_config(state: &AppState, control_id: &str, request: &Request) -> Response {
    let Some(control) = state.controls.get(control_id) else {
        return not_found();
    };
    let update = match request.data() {
        Some(body) => RuleUpdate::from_reader(body),
        None => Ok(RuleUpdate::default()),
    };
    let update = match update {
        Ok(u) => u,
        Err(e) => {
            warn!("[{}] Rejected config update: {}", control_id, e);
            return error_response(400, &e.to_string());
        }
    };
    match control.rules.update_config(control_id, update) {
        Ok(rule) => {
            info!(
                "[{}] Config updated: {}/{} {} {} -> {} (enabled={})",
                control_id, rule.sensor_id, rule.metric, rule.operator, rule.target_value, rule.device_id, rule.enabled
            );
            Response::json(&json!({ "status": "ok", "config": rule }))
        }
        Err(e) => {
            error!("[{}] Saving config failed: {}", control_id, e);
            storage_unavailable()
        }
    }
}

fn manual(state: &AppState, control_id: &str, request: &Request) -> Response {
    if !state.controls.contains_key(control_id) {
        return not_found();
    }
    let payload: ManualRequest = match read_json(request) {
        Ok(p) => p,
        Err(e) => return error_response(400, &format!("malformed payload: {}", e)),
    };
    let success = manual_control(&state.registry, &payload.device_id, &payload.action);
    Response::json(&json!({
        "status": if success { "ok" } else { "error" },
        "action": payload.action,
    }))
}

fn sensor_data(state: &AppState, sensor_id: &str) -> Response {
    let Some(sensor) = state.registry.find(sensor_id).filter(|d| d.is_sensor()) else {
        return not_found();
    };

    let mut current = Map::new();
    for metric in &sensor.metrics {
        match state.readings.latest(sensor_id, metric) {
            Ok(Some((_, value))) => {
                current.insert(metric.clone(), json!(value));
            }
            Ok(None) => {}
            Err(e) => {
                error!("[{}] Loading latest {} failed: {}", sensor_id, metric, e);
                return storage_unavailable();
            }
        }
    }

    let since = history_start(Utc::now(), state.history_hours);
    let history = match state.readings.history(sensor_id, &since) {
        Ok(rows) => rows,
        Err(e) => {
            error!("[{}] Loading history failed: {}", sensor_id, e);
            return storage_unavailable();
        }
    };

    // One row per timestamp, one column per metric.
    let mut by_ts: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    for reading in history {
        let row = by_ts.entry(reading.ts.clone()).or_insert_with(|| {
            let mut row = Map::new();
            row.insert("ts".to_string(), json!(reading.ts));
            row
        });
        row.insert(reading.metric, json!(reading.value));
    }
    let history = by_ts.into_values().map(Value::Object).collect::<Vec<_>>();

    Response::json(&json!({ "current": current, "history": history }))
}

fn device_status(state: &AppState, device_id: &str) -> Response {
    if !state.registry.find(device_id).is_some_and(|d| d.is_actuator()) {
        return not_found();
    }
    let since = history_start(Utc::now(), state.history_hours);
    match state.registry.log().status(device_id, &since) {
        Ok(status) => Response::json(&status),
        Err(e) => {
            error!("[{}] Loading status failed: {}", device_id, e);
            storage_unavailable()
        }
    }
}

fn device_control(state: &AppState, device_id: &str, request: &Request) -> Response {
    if !state.registry.find(device_id).is_some_and(|d| d.is_actuator()) {
        return not_found();
    }
    let payload: ControlRequest = match read_json(request) {
        Ok(p) => p,
        Err(e) => return error_response(400, &format!("malformed payload: {}", e)),
    };
    let success = state.registry.actuate(device_id, payload.action == "on");
    Response::json(&json!({
        "result": if success { "ok" } else { "error" },
        "action": payload.action,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlDefaults;
    use crate::db::pool::testing::{TestDb, test_db};
    use crate::devices::registry::tests::{test_registry, virtual_switch};
    use crate::services::rules::RuleStore;
    use crate::utils::now_timestamp;

    fn state(db: &TestDb) -> AppState {
        let registry = Arc::new(test_registry(db));
        let readings = ReadingStore::new(db.pool.clone());
        let control = Control {
            control_id: "c1".into(),
            defaults: ControlDefaults {
                sensor_id: "s1".into(),
                device_id: "d1".into(),
                metric: "temperature_C".into(),
                ..ControlDefaults::default()
            },
            rules: RuleStore::new(db.pool.clone()),
            readings: readings.clone(),
            registry: registry.clone(),
        };
        AppState {
            controls: HashMap::from([("c1".to_string(), control)]),
            registry,
            readings,
            history_hours: 24,
            clock: true,
        }
    }

    fn body_json(response: Response) -> Value {
        let (mut reader, _) = response.data.into_reader_and_size();
        let mut raw = String::new();
        reader.read_to_string(&mut raw).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    fn post(url: &str, body: &str) -> Request {
        Request::fake_http(
            "POST",
            url,
            vec![("Content-Type".into(), "application/json".into())],
            body.as_bytes().to_vec(),
        )
    }

    fn get(url: &str) -> Request {
        Request::fake_http("GET", url, vec![], vec![])
    }

    #[test]
    fn config_round_trip() {
        let db = test_db();
        let state = state(&db);

        let response = handle(&state, &get("/api/c1/config"));
        assert_eq!(response.status_code, 200);
        let rule = body_json(response);
        assert_eq!(rule["sensor_id"], "s1");
        assert_eq!(rule["enabled"], false);

        let response = handle(
            &state,
            &post(
                "/api/c1/config",
                r#"{"sensor_id":"s1","device_id":"d1","metric":"temperature_C","operator":"<","target_value":18,"enabled":true}"#,
            ),
        );
        assert_eq!(response.status_code, 200);
        let body = body_json(response);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["config"]["operator"], "<");
        assert_eq!(body["config"]["target_value"], 18.0);

        let rule = body_json(handle(&state, &get("/api/c1/config")));
        assert_eq!(rule["enabled"], true);
    }

    #[test]
    fn malformed_config_is_rejected_without_writing() {
        let db = test_db();
        let state = state(&db);
        let response = handle(&state, &post("/api/c1/config", r#"{"target_value":"hot"}"#));
        assert_eq!(response.status_code, 400);
        assert_eq!(body_json(response)["status"], "error");

        let rule = body_json(handle(&state, &get("/api/c1/config")));
        assert_eq!(rule["sensor_id"], "s1");
    }

    #[test]
    fn unknown_control_is_not_found() {
        let db = test_db();
        let state = state(&db);
        assert_eq!(handle(&state, &get("/api/nope/config")).status_code, 404);
        assert_eq!(handle(&state, &post("/api/nope/manual", "{}")).status_code, 404);
    }

    #[test]
    fn manual_override_reports_outcome() {
        let db = test_db();
        let state = state(&db);

        let body = body_json(handle(&state, &post("/api/c1/manual", r#"{"device_id":"d1","action":"on"}"#)));
        assert_eq!(body, json!({"status": "ok", "action": "on"}));
        assert_eq!(virtual_switch(&state.registry, "d1").state(), Some(true));

        let body = body_json(handle(&state, &post("/api/c1/manual", r#"{"device_id":"ghost","action":"off"}"#)));
        assert_eq!(body, json!({"status": "error", "action": "off"}));
    }

    #[test]
    fn device_control_and_status() {
        let db = test_db();
        let state = state(&db);

        let body = body_json(handle(&state, &post("/api/d1/control", r#"{"action":"on"}"#)));
        assert_eq!(body, json!({"result": "ok", "action": "on"}));

        let status = body_json(handle(&state, &get("/api/d1/status")));
        assert_eq!(status["current"]["state"], "on");
        assert_eq!(status["history"].as_array().unwrap().len(), 1);

        assert_eq!(handle(&state, &get("/api/s1/status")).status_code, 404);
    }

    #[test]
    fn sensor_data_pivots_metrics_by_timestamp() {
        let db = test_db();
        let state = state(&db);
        let ts = now_timestamp();
        state.readings.insert("s1", &ts, "temperature_C", 21.5).unwrap();
        state.readings.insert("s1", &ts, "humidity_RH", 40.0).unwrap();
        state.readings.insert("s1", "2000-01-01T00:00:00.000000", "temperature_C", 5.0).unwrap();

        let body = body_json(handle(&state, &get("/api/s1/sensor_data")));
        assert_eq!(body["current"], json!({"temperature_C": 21.5}));
        assert_eq!(
            body["history"],
            json!([{"ts": ts, "temperature_C": 21.5, "humidity_RH": 40.0}])
        );
        assert_eq!(handle(&state, &get("/api/d1/sensor_data")).status_code, 404);
    }

    #[test]
    fn device_options_list_capabilities() {
        let db = test_db();
        let state = state(&db);
        let body = body_json(handle(&state, &get("/api/devices")));
        assert_eq!(body["sensors"][0]["id"], "s1");
        assert_eq!(body["sensors"][0]["metrics"], json!(["temperature_C"]));
        assert_eq!(body["actuators"].as_array().unwrap().len(), 2);
        assert_eq!(body["operators"], json!([">", ">=", "<", "<=", "="]));
    }

    fn drop_table(db: &TestDb, table: &str) {
        use diesel::connection::SimpleConnection;
        let mut conn = db.pool.get().unwrap();
        conn.batch_execute(&format!("DROP TABLE {}", table)).unwrap();
    }

    #[test]
    fn storage_failure_is_reported_in_the_body() {
        let db = test_db();
        let state = state(&db);
        drop_table(&db, "control_configs");
        drop_table(&db, "readings");
        drop_table(&db, "device_logs");

        for request in [
            get("/api/c1/config"),
            post(
                "/api/c1/config",
                r#"{"sensor_id":"s1","device_id":"d1","metric":"temperature_C","target_value":1,"enabled":true}"#,
            ),
            get("/api/s1/sensor_data"),
            get("/api/d1/status"),
        ] {
            let url = request.raw_url().to_string();
            let response = handle(&state, &request);
            assert_eq!(response.status_code, 200, "{}", url);
            assert_eq!(
                body_json(response),
                json!({"status": "error", "message": "storage unavailable"}),
                "{}",
                url
            );
        }
    }

    #[test]
    fn server_answers_until_stopped() {
        let db = test_db();
        let server = serve(state(&db), "127.0.0.1:0").unwrap();
        let url = format!("http://{}/api/devices", server.addr());

        let body: Value = ureq::get(&url).call().unwrap().body_mut().read_json().unwrap();
        assert_eq!(body["sensors"][0]["id"], "s1");

        let started = std::time::Instant::now();
        server.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn clock_reports_time() {
        let db = test_db();
        let state = state(&db);
        let body = body_json(handle(&state, &get("/api/clock")));
        assert!(body["ts"].as_f64().unwrap() > 0.0);
        assert_eq!(body["datetime"].as_str().unwrap().len(), 19);
    }
}
