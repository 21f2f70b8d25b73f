pub mod ledger;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::LedgerError;
use crate::models::AuthState;
use crate::services::LedgerController;

#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<LedgerController>,
    /// upstream end of the auth boundary the controller watches
    pub auth_tx: Arc<watch::Sender<AuthState>>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/state", get(ledger::get_state))
        .route("/api/events", get(ledger::events))
        // Account binding
        .route("/api/account/source", post(ledger::select_source))
        .route("/api/auth", post(ledger::push_auth))
        // Balance
        .route("/api/balance/refresh", post(ledger::refresh_balance))
        .route("/api/balance/auto-refresh", post(ledger::set_auto_refresh))
        .route("/api/inputs/:field", put(ledger::set_input))
        // Deposits
        .route("/api/deposit/self", post(ledger::deposit_self))
        .route("/api/deposit/for", post(ledger::deposit_for))
        // Withdrawals
        .route("/api/withdraw/request", post(ledger::request_withdraw))
        .route("/api/withdraw/check", post(ledger::check_eligibility))
        .route("/api/withdraw/execute", post(ledger::execute_withdraw))
        .route("/api/notice/dismiss", post(ledger::dismiss_notice))
        .with_state(state)
}

fn status_for(error: &LedgerError) -> StatusCode {
    match error {
        LedgerError::InvalidAmount(_) | LedgerError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
        LedgerError::Configuration(_) => StatusCode::FORBIDDEN,
        LedgerError::AccountUnavailable | LedgerError::SessionUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        LedgerError::Derivation(_) | LedgerError::OperationFailure { .. } => StatusCode::BAD_GATEWAY,
        LedgerError::AlreadyPending
        | LedgerError::NoPendingWithdrawal
        | LedgerError::Busy(_)
        | LedgerError::NotExecutable { .. } => StatusCode::CONFLICT,
        LedgerError::InsufficientBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::warn!("Request rejected: {}", self);
        }
        (
            status,
            Json(serde_json::json!({
                "error": self.to_string(),
                "kind": self.kind(),
            })),
        )
            .into_response()
    }
}
