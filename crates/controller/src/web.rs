use anyhow::Context;
use axum::extract::rejection::FormRejection;
use axum::extract::{Form, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::controller::{ConfigUpdate, ZoneId};
use crate::error::ControlError;
use crate::state::SharedState;

const INDEX_HTML: &str = include_str!("ui/index.html");

/// Request parameters, from the query string and/or a urlencoded body.
type Params = HashMap<String, String>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/sensors", get(api_sensors))
        .route("/api/status", get(api_status))
        .route("/api/irrigation/start", get(api_start).post(api_start))
        .route("/api/irrigation/stop", get(api_stop).post(api_stop))
        .route("/api/config", get(api_config).post(api_set_config))
        .with_state(state)
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, self.to_string()).into_response()
    }
}

/// Body fields win over query fields of the same name. A missing or
/// non-form body is not an error.
fn merge(Query(mut params): Query<Params>, form: Result<Form<Params>, FormRejection>) -> Params {
    if let Ok(Form(body)) = form {
        params.extend(body);
    }
    params
}

fn field<'a>(params: &'a Params, name: &str) -> Option<&'a str> {
    params
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn parse_f32(params: &Params, name: &str) -> Result<Option<f32>, ControlError> {
    field(params, name)
        .map(|v| {
            v.parse::<f32>()
                .map_err(|_| ControlError::invalid_value(format!("{name} '{v}' is not a number")))
        })
        .transpose()
}

fn parse_start(params: &Params) -> Result<(ZoneId, Option<u32>), ControlError> {
    let zone = field(params, "zone")
        .ok_or(ControlError::MissingParameter("Zone"))?
        .parse::<ZoneId>()?;
    let duration = field(params, "duration")
        .map(|v| {
            v.parse::<u32>().map_err(|_| {
                ControlError::invalid_value(format!("duration '{v}' is not a whole number of minutes"))
            })
        })
        .transpose()?;
    Ok((zone, duration))
}

fn parse_config(params: &Params) -> Result<ConfigUpdate, ControlError> {
    let auto_mode = match field(params, "autoMode") {
        None => None,
        Some("true") => Some(true),
        Some("false") => Some(false),
        Some(other) => {
            return Err(ControlError::invalid_value(format!(
                "autoMode must be 'true' or 'false', got '{other}'"
            )))
        }
    };
    Ok(ConfigUpdate {
        auto_mode,
        moisture_low: parse_f32(params, "moistureLowThreshold")?,
        moisture_high: parse_f32(params, "moistureHighThreshold")?,
        temp_high: parse_f32(params, "tempHighThreshold")?,
    })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn api_sensors(State(state): State<SharedState>) -> impl IntoResponse {
    let st = state.read().await;
    Json(st.sensors_view())
}

async fn api_status(State(state): State<SharedState>) -> impl IntoResponse {
    let st = state.read().await;
    Json(st.to_status())
}

async fn api_start(
    State(state): State<SharedState>,
    query: Query<Params>,
    form: Result<Form<Params>, FormRejection>,
) -> Result<&'static str, ControlError> {
    let params = merge(query, form);
    let mut st = state.write().await;
    let (zone, duration) = parse_start(&params).inspect_err(|e| st.record_rejected("start", e))?;
    st.start_zone(zone, duration)?;
    Ok("Irrigation started")
}

async fn api_stop(State(state): State<SharedState>) -> &'static str {
    state.write().await.stop_all();
    "Irrigation stopped"
}

async fn api_config(State(state): State<SharedState>) -> impl IntoResponse {
    let st = state.read().await;
    Json(st.config_view())
}

async fn api_set_config(
    State(state): State<SharedState>,
    query: Query<Params>,
    form: Result<Form<Params>, FormRejection>,
) -> Result<&'static str, ControlError> {
    let params = merge(query, form);
    let mut st = state.write().await;
    let update = parse_config(&params).inspect_err(|e| st.record_rejected("config", e))?;
    st.set_config(update)?;
    Ok("Configuration updated")
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: SharedState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    tracing::info!(%addr, "web ui listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Phase;
    use crate::scheduler::ManualClock;
    use crate::state::tests::test_state;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    fn test_shared() -> SharedState {
        Arc::new(RwLock::new(test_state(Arc::new(ManualClock::new(0)))))
    }

    async fn send(shared: &SharedState, req: Request<Body>) -> (StatusCode, String) {
        let resp = router(shared.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn get(shared: &SharedState, uri: &str) -> (StatusCode, String) {
        send(shared, Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn post_form(shared: &SharedState, uri: &str, body: &str) -> (StatusCode, String) {
        let req = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(shared, req).await
    }

    fn json(body: &str) -> serde_json::Value {
        serde_json::from_str(body).unwrap()
    }

    // -- GET / ----------------------------------------------------------------

    #[tokio::test]
    async fn index_serves_dashboard() {
        let resp = router(test_shared())
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
    }

    // -- /api/sensors -----------------------------------------------------------

    #[tokio::test]
    async fn sensors_reports_snapshot_and_flags() {
        let shared = test_shared();
        let (status, body) = get(&shared, "/api/sensors").await;
        assert_eq!(status, StatusCode::OK);

        let v = json(&body);
        assert_eq!(v["soilMoisture"].as_array().unwrap().len(), 5);
        for key in [
            "temperature",
            "humidity",
            "lightIntensity",
            "isRaining",
            "batteryVoltage",
            "timestamp",
            "irrigationActive",
            "autoMode",
            "manualOverride",
            "powerSave",
            "moistureBand",
        ] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
        assert_eq!(v["irrigationActive"], false);
    }

    // -- /api/irrigation/start --------------------------------------------------

    #[tokio::test]
    async fn start_requires_zone() {
        let shared = test_shared();
        let (status, body) = get(&shared, "/api/irrigation/start").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Zone parameter required");
        assert_eq!(
            shared.read().await.events.back().unwrap().kind,
            crate::state::EventKind::Error
        );
    }

    #[tokio::test]
    async fn start_zone_with_duration() {
        let shared = test_shared();
        let (status, body) = get(&shared, "/api/irrigation/start?zone=1&duration=10").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Irrigation started");

        let st = shared.read().await;
        let irr = st.controller.state();
        assert!(irr.manual_override);
        assert!(matches!(&irr.phase, Phase::ManualOverride(s) if s.planned_ms == 10 * 60_000));
    }

    #[tokio::test]
    async fn start_defaults_duration() {
        let shared = test_shared();
        let (status, _) = get(&shared, "/api/irrigation/start?zone=2").await;
        assert_eq!(status, StatusCode::OK);
        let st = shared.read().await;
        assert_eq!(st.controller.state().zones[1].duration_min, 15);
    }

    #[tokio::test]
    async fn start_rejects_bad_input() {
        let shared = test_shared();
        for uri in [
            "/api/irrigation/start?zone=9",
            "/api/irrigation/start?zone=front",
            "/api/irrigation/start?zone=1&duration=0",
            "/api/irrigation/start?zone=1&duration=31",
            "/api/irrigation/start?zone=1&duration=ten",
        ] {
            let (status, _) = get(&shared, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        }
        assert_eq!(shared.read().await.controller.state().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn start_accepts_form_body() {
        let shared = test_shared();
        let (status, _) = post_form(&shared, "/api/irrigation/start", "zone=2&duration=5").await;
        assert_eq!(status, StatusCode::OK);
        assert!(shared.read().await.controller.state().zones[1].active);
    }

    // -- /api/irrigation/stop ---------------------------------------------------

    #[tokio::test]
    async fn stop_always_succeeds() {
        let shared = test_shared();
        let (status, body) = get(&shared, "/api/irrigation/stop").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Irrigation stopped");

        get(&shared, "/api/irrigation/start?zone=1").await;
        let (status, _) = send(
            &shared,
            Request::post("/api/irrigation/stop").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let st = shared.read().await;
        assert_eq!(st.controller.state().phase, Phase::Idle);
        assert!(!st.controller.state().manual_override);
    }

    // -- /api/config ------------------------------------------------------------

    #[tokio::test]
    async fn config_get_returns_thresholds() {
        let shared = test_shared();
        let (status, body) = get(&shared, "/api/config").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json(&body),
            serde_json::json!({
                "autoMode": true,
                "moistureLowThreshold": 30.0,
                "moistureHighThreshold": 70.0,
                "tempHighThreshold": 35.0
            })
        );
    }

    #[tokio::test]
    async fn config_post_updates_auto_mode() {
        let shared = test_shared();
        let (status, body) = post_form(&shared, "/api/config", "autoMode=false").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Configuration updated");
        assert!(!shared.read().await.controller.state().auto_mode);
    }

    #[tokio::test]
    async fn config_post_accepts_query_fields() {
        let shared = test_shared();
        let req = Request::post("/api/config?moistureLowThreshold=25&tempHighThreshold=38")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&shared, req).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = get(&shared, "/api/config").await;
        let v = json(&body);
        assert_eq!(v["moistureLowThreshold"], 25.0);
        assert_eq!(v["tempHighThreshold"], 38.0);
    }

    #[tokio::test]
    async fn config_post_rejects_inverted_thresholds() {
        let shared = test_shared();
        let (status, _) = post_form(
            &shared,
            "/api/config",
            "moistureLowThreshold=80&moistureHighThreshold=30",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = get(&shared, "/api/config").await;
        assert_eq!(json(&body)["moistureLowThreshold"], 30.0);
    }

    #[tokio::test]
    async fn config_post_rejects_malformed_fields() {
        let shared = test_shared();
        for body in ["autoMode=yes", "moistureLowThreshold=dry", "tempHighThreshold=NaN"] {
            let (status, _) = post_form(&shared, "/api/config", body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        }
        assert!(shared.read().await.controller.state().auto_mode);
    }

    // -- /api/status ------------------------------------------------------------

    #[tokio::test]
    async fn status_includes_state_and_recent_events() {
        let shared = test_shared();
        get(&shared, "/api/irrigation/start?zone=1").await;
        get(&shared, "/api/irrigation/stop").await;

        let (status, body) = get(&shared, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        let v = json(&body);
        assert_eq!(v["irrigation"]["phase"]["kind"], "idle");
        assert_eq!(v["config"]["autoMode"], true);
        let events = v["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0]["detail"].as_str().unwrap().contains("stopped"));
        assert_eq!(events[0]["kind"], "control");
    }
}
