//! API integration tests

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{json, Value};
use tower::util::ServiceExt;

use monsrv::api::create_router;

mod common;
use common::*;

/// Helper to make JSON requests
async fn json_request(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let body = match body {
        Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
        None => Body::empty(),
    };
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    let body: Value = if body_bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body_bytes).unwrap()
    };

    (status, body)
}

#[tokio::test]
async fn test_health_check() {
    let ctx = context(test_config(), Some(serial_bus()), Some(symo_bus()));
    let app = create_router(ctx);

    let (status, body) = json_request(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["monitor"], "stopped");
    assert_eq!(body["health"]["status"], "healthy");
    assert_eq!(body["subscribers"], 0);
    assert_eq!(body["history"], 0);
}

#[tokio::test]
async fn test_unconfigured_device_is_not_found() {
    let ctx = context(test_config(), Some(serial_bus()), None);
    let app = create_router(ctx);

    let (status, body) = json_request(&app, "GET", "/data/froniussymo", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("froniusSymo"));
    assert!(body["ts"].is_string());
}

#[tokio::test]
async fn test_monitor_history_and_latest() {
    let serial = serial_bus();
    let ctx = context(test_config(), Some(serial.clone()), Some(symo_bus()));
    serial.set_i32(GRID_METER_UNIT, 9, -4200);
    for i in 0..3 {
        ctx.monitor.tick_once(at(1, 12, 0, i)).await.unwrap();
    }
    let app = create_router(ctx);

    let (status, body) = json_request(&app, "GET", "/data/monitor", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 3);

    let (status, body) = json_request(&app, "GET", "/data/monitor?latest", None).await;
    assert_eq!(status, StatusCode::OK);
    let records = body.as_array().unwrap();
    assert_eq!(records.len(), 1);
    // Grid meter takes precedence over the inverter's smart meter
    let power = records[0]["gridmeter"]["activePower"].as_f64().unwrap();
    assert!((power + 420.0).abs() < 1e-9);
    assert!(records[0].get("meter").is_none());
    assert_eq!(records[0]["extMeters"][0]["name"], "pvWest");
    assert!(records[0]["heatpump"].is_object());

    let (_, body) = json_request(&app, "GET", "/data/monitor?latest=false", None).await;
    assert_eq!(body.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_fronius_symo_block_flags() {
    let ctx = context(test_config(), Some(serial_bus()), Some(symo_bus()));
    let symo = ctx.symo.clone().unwrap();
    symo.read_inverter().await.unwrap();
    symo.read_storage().await.unwrap();
    let app = create_router(ctx);

    let (status, body) = json_request(&app, "GET", "/data/froniussymo?inverter", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["inverter"].is_object());
    assert!(body.get("storage").is_none());

    let (_, body) = json_request(&app, "GET", "/data/froniussymo", None).await;
    assert!(body["inverter"].is_object());
    assert!(body["storage"].is_object());
    // Never read, so absent even when requested
    assert!(body.get("meter").is_none());

    let (status, _) = json_request(&app, "GET", "/data/froniussymo?battery", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_nibe_unknown_id_is_bad_request() {
    let ctx = context(test_config(), Some(serial_bus()), None);
    let app = create_router(ctx);

    let (status, _) = json_request(&app, "GET", "/data/nibe1155?id=40999", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = json_request(&app, "GET", "/data/nibe1155?id=abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = json_request(&app, "GET", "/data/nibe1155?id=40004", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["controller"].is_object());
    assert!(body["completeValues"].is_object());
}

#[tokio::test]
async fn test_nibe_logset_values() {
    let ctx = context(test_config(), Some(serial_bus()), None);
    let nibe = ctx.nibe.clone().unwrap();
    nibe.read_complete_values().await.unwrap();
    assert_eq!(nibe.read_simple_values().await.unwrap(), 3);
    let app = create_router(ctx);

    let (status, body) = json_request(&app, "GET", "/data/nibe1155?simpleValues", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["logsetIds"], json!([40004, 40008, 43141]));
    assert_eq!(body["simpleValues"].as_object().unwrap().len(), 3);
    assert!(body.get("completeValues").is_none());
    assert!(body.get("controller").is_none());
}

#[tokio::test]
async fn test_heatpump_mode_write() {
    let serial = serial_bus();
    let ctx = context(test_config(), Some(serial.clone()), None);
    let app = create_router(ctx);

    let request = json!({ "mode": "manual", "degreeMinutes": -120.0 });
    let (status, body) =
        json_request(&app, "POST", "/control/heatpumpmode", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "manual");
    assert_eq!(body["degreeMinutes"], -120.0);
    assert_eq!(serial.get_register(NIBE_UNIT, 47137 - 40001), Some(1));

    let (status, _) = json_request(
        &app,
        "POST",
        "/control/heatpumpmode",
        Some(json!({ "mode": "turbo" })),
    )
    .await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_statistics_endpoint() {
    let ctx = context(test_config(), Some(serial_bus()), Some(symo_bus()));
    ctx.monitor.tick_once(at(1, 12, 0, 0)).await.unwrap();
    ctx.monitor.tick_once(at(1, 12, 0, 1)).await.unwrap();
    let app = create_router(ctx);

    let (status, body) = json_request(&app, "GET", "/data/statistics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalRecords"], 2);
    assert_eq!(body["today"]["records"], 2);
    assert!(body["yesterday"].is_null());
}
