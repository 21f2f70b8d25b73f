use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::StreamExt;

use super::ApiState;
use crate::error::LedgerError;
use crate::models::{AccountSelection, AuthState, InputField};

#[derive(Debug, Deserialize)]
pub struct AutoRefreshRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub value: String,
}

pub async fn get_state(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.controller.state())
}

/// Pushes a state snapshot on every revision and relays ledger changes.
pub async fn events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let controller = state.controller.clone();
    let snapshots = WatchStream::new(state.controller.subscribe())
        .map(move |_| Event::default().event("state").json_data(controller.state()));
    let changes = BroadcastStream::new(state.controller.ledger_events())
        .filter_map(|change| change.ok())
        .map(|change| Event::default().event("ledger_changed").json_data(change));

    Sse::new(snapshots.merge(changes)).keep_alive(KeepAlive::default())
}

pub async fn select_source(
    State(state): State<ApiState>,
    Json(selection): Json<AccountSelection>,
) -> Result<Response, LedgerError> {
    state.controller.select_source(selection).await?;
    Ok(Json(state.controller.state()).into_response())
}

pub async fn push_auth(State(state): State<ApiState>, Json(auth): Json<AuthState>) -> impl IntoResponse {
    tracing::info!("Auth update received (credential: {})", auth.has_credential);
    state.auth_tx.send_replace(auth);
    StatusCode::ACCEPTED
}

pub async fn refresh_balance(State(state): State<ApiState>) -> Result<Response, LedgerError> {
    let balance = state.controller.refresh_balance().await?;
    Ok(Json(balance).into_response())
}

pub async fn set_auto_refresh(
    State(state): State<ApiState>,
    Json(request): Json<AutoRefreshRequest>,
) -> Result<Response, LedgerError> {
    state.controller.set_auto_refresh(request.enabled).await?;
    Ok(Json(state.controller.state()).into_response())
}

pub async fn set_input(
    State(state): State<ApiState>,
    Path(field): Path<String>,
    Json(request): Json<InputRequest>,
) -> Response {
    let Some(field) = InputField::from_str(&field) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown input field {}", field) })),
        )
            .into_response();
    };
    state.controller.set_input(field, request.value);
    StatusCode::NO_CONTENT.into_response()
}

pub async fn deposit_self(State(state): State<ApiState>) -> Result<Response, LedgerError> {
    let outcome = state.controller.deposit_self().await?;
    Ok((StatusCode::CREATED, Json(outcome)).into_response())
}

pub async fn deposit_for(State(state): State<ApiState>) -> Result<Response, LedgerError> {
    let outcome = state.controller.deposit_for().await?;
    Ok((StatusCode::CREATED, Json(outcome)).into_response())
}

pub async fn request_withdraw(State(state): State<ApiState>) -> Result<Response, LedgerError> {
    let outcome = state.controller.request_withdraw().await?;
    Ok((StatusCode::CREATED, Json(outcome)).into_response())
}

pub async fn check_eligibility(State(state): State<ApiState>) -> Result<Response, LedgerError> {
    let eligibility = state.controller.check_eligibility().await?;
    Ok(Json(eligibility).into_response())
}

pub async fn execute_withdraw(State(state): State<ApiState>) -> Result<Response, LedgerError> {
    let outcome = state.controller.execute_withdraw().await?;
    Ok(Json(outcome).into_response())
}

pub async fn dismiss_notice(State(state): State<ApiState>) -> impl IntoResponse {
    state.controller.dismiss_notice();
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router;
    use crate::config::ControllerConfig;
    use crate::services::local_ledger::LocalLedger;
    use crate::services::test_support::{address, ManualClock};
    use crate::services::{ControllerDeps, LedgerController};
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<LedgerController>) {
        let clock = ManualClock::new();
        let ledger = LocalLedger::new(Duration::from_secs(3600), clock.clone());
        let mut config = ControllerConfig::new("local");
        config.call_timeout = None;
        config.countdown_tick = Duration::ZERO;
        let controller = LedgerController::new(
            config,
            ControllerDeps {
                connector: Some(Arc::new(ledger)),
                deriver: None,
                clock,
                preferences: None,
            },
        )
        .unwrap();
        let (auth_tx, auth_rx) = watch::channel(AuthState::default());
        controller.watch_auth(auth_rx);
        let state = ApiState {
            controller: controller.clone(),
            auth_tx: Arc::new(auth_tx),
        };
        (router(state), controller)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn select_self(app: &Router, n: u64) {
        let (status, body) = call(
            app,
            "POST",
            "/api/account/source",
            Some(json!({"source": "self_custodied", "address": address(n).to_string()})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["account"]["address"], address(n).to_string());
    }

    async fn set_input(app: &Router, field: &str, value: &str) {
        let (status, _) = call(app, "PUT", &format!("/api/inputs/{}", field), Some(json!({"value": value}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn state_reports_network() {
        let (app, controller) = app();
        let (status, body) = call(&app, "GET", "/api/state", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["network"], "local");
        assert!(body["account"].is_null());
        controller.shutdown();
    }

    #[tokio::test]
    async fn deposit_then_refresh() {
        let (app, controller) = app();
        select_self(&app, 1).await;
        set_input(&app, "deposit_self_amount", "1.5").await;

        let (status, outcome) = call(&app, "POST", "/api/deposit/self", None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(outcome["transaction_reference"].as_str().unwrap().starts_with("0x"));

        let (status, balance) = call(&app, "POST", "/api/balance/refresh", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(balance["total_balance"]["raw"], "1500000000000000000");

        let (_, state) = call(&app, "GET", "/api/state", None).await;
        assert_eq!(state["inputs"]["deposit_self_amount"], Value::Null);
        controller.shutdown();
    }

    #[tokio::test]
    async fn operations_without_account_are_unavailable() {
        let (app, controller) = app();
        let (status, body) = call(&app, "POST", "/api/withdraw/request", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["kind"], "account_unavailable");
        controller.shutdown();
    }

    #[tokio::test]
    async fn unknown_input_field_is_not_found() {
        let (app, controller) = app();
        let (status, _) = call(&app, "PUT", "/api/inputs/nickname", Some(json!({"value": "x"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        controller.shutdown();
    }

    #[tokio::test]
    async fn withdrawal_errors_map_to_statuses() {
        let (app, controller) = app();
        select_self(&app, 1).await;
        call(&app, "POST", "/api/balance/refresh", None).await;

        set_input(&app, "withdraw_amount", "1").await;
        let (status, body) = call(&app, "POST", "/api/withdraw/request", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "insufficient_balance");

        set_input(&app, "deposit_self_amount", "2").await;
        call(&app, "POST", "/api/deposit/self", None).await;
        call(&app, "POST", "/api/balance/refresh", None).await;
        let (status, _) = call(&app, "POST", "/api/withdraw/request", None).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(&app, "POST", "/api/withdraw/execute", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "not_executable");

        set_input(&app, "withdraw_amount", "0.5").await;
        let (status, body) = call(&app, "POST", "/api/withdraw/request", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "already_pending");
        controller.shutdown();
    }

    #[tokio::test]
    async fn auth_updates_are_accepted() {
        let (app, controller) = app();
        let (status, _) = call(
            &app,
            "POST",
            "/api/auth",
            Some(json!({"has_credential": true, "public_key_id": "pk-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        controller.shutdown();
    }
}
