//! REST surface over the lifecycle manager.
//!
//! Identity arrives in the `x-user-id` / `x-user-role` headers, set by the
//! authentication proxy in front of this server. For the `Responder` role the
//! user id is the driver id.

use crate::dispatch_logic::model::{
    ActionResponse, CreateReportRequest, CreateReportResponse, DriverActionRequest, HealthResponse,
};
use crate::dispatch_logic::state::AppState;
use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use lib_dispatch::{AssignmentId, DispatchError, DriverId, PendingAssignment, Role, UserId};
use serde_json::json;
use tracing::{error, info, warn};

const NO_AMBULANCE_MESSAGE: &str =
    "No ambulances available at the moment, please call the emergency line directly";

/// # Application Error
///
/// Maps dispatch failures onto HTTP status codes with a JSON body.
#[derive(Debug)]
pub enum AppError {
    /// A lifecycle or store error.
    Dispatch(DispatchError),
    /// Identity headers missing or malformed.
    MissingIdentity(&'static str),
}

impl From<DispatchError> for AppError {
    fn from(e: DispatchError) -> Self {
        AppError::Dispatch(e)
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::MissingIdentity(what) => (StatusCode::UNAUTHORIZED, "Unauthenticated", what.to_string()),
            AppError::Dispatch(e) => match e {
                DispatchError::InvalidReport(msg) => (StatusCode::BAD_REQUEST, "InvalidReport", msg.clone()),
                DispatchError::NoCapacity { .. } | DispatchError::CapacityExhausted { .. } => {
                    (StatusCode::CONFLICT, "NoCapacity", NO_AMBULANCE_MESSAGE.to_string())
                }
                DispatchError::StaleAssignment { .. } => (StatusCode::CONFLICT, "StaleAssignment", e.to_string()),
                DispatchError::ActiveAssignmentExists { .. } => {
                    (StatusCode::CONFLICT, "ActiveAssignmentExists", e.to_string())
                }
                DispatchError::Unauthorized { .. } => {
                    (StatusCode::NOT_FOUND, "NotFound", "Assignment not found".to_string())
                }
                DispatchError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound", e.to_string()),
                DispatchError::Forbidden(_) => (StatusCode::FORBIDDEN, "Forbidden", e.to_string()),
                DispatchError::TransientStoreFailure(_) | DispatchError::HubClosed => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "ServiceUnavailable",
                    "Dispatch temporarily unavailable, please retry".to_string(),
                ),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = self.parts();
        if status.is_server_error() {
            error!("Request failed: {:?}", self);
        } else {
            warn!("Request rejected ({}): {}", status.as_u16(), message);
        }
        (status, Json(json!({ "error_type": error_type, "message": message }))).into_response()
    }
}

/// Identity established by the upstream authentication layer.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub user_id: i64,
    pub role: Role,
}

impl Caller {
    fn require(self, role: Role) -> Result<Self, AppError> {
        if self.role == role {
            Ok(self)
        } else {
            Err(DispatchError::Forbidden(self.role).into())
        }
    }

    pub fn driver_id(self) -> Result<DriverId, AppError> {
        Ok(DriverId(self.require(Role::Responder)?.user_id))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok());
        let user_id = header("x-user-id")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .ok_or(AppError::MissingIdentity("missing or invalid x-user-id"))?;
        let role = header("x-user-role")
            .and_then(|v| Role::parse(v.trim()))
            .ok_or(AppError::MissingIdentity("missing or invalid x-user-role"))?;
        Ok(Caller { user_id, role })
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/report/create", post(create_report))
        .route("/api/driver/assignment/{assignment_id}", post(driver_action))
        .route("/api/driver/assignment/{assignment_id}/complete", post(complete_assignment))
        .route("/api/driver/pending", get(pending_assignments))
}

async fn health_handler(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    let connected = state.hub.connected_drivers().await?;
    Ok(Json(HealthResponse {
        status: "OK",
        connected_responders: connected.len(),
    }))
}

async fn create_report(
    State(state): State<AppState>,
    caller: Caller,
    Json(body): Json<CreateReportRequest>,
) -> Result<(StatusCode, Json<CreateReportResponse>), AppError> {
    let caller = caller.require(Role::Public)?;
    let created = state
        .manager
        .create_report(body.into_new_report(UserId(caller.user_id)))
        .await?;
    info!(
        "Report {} created by user {} and assigned ({})",
        created.report_id, caller.user_id, created.assignment_id
    );
    Ok((
        StatusCode::CREATED,
        Json(CreateReportResponse {
            message: "Report created and assigned",
            report_id: created.report_id,
            assignment_id: created.assignment_id,
        }),
    ))
}

async fn driver_action(
    State(state): State<AppState>,
    caller: Caller,
    Path(assignment_id): Path<i64>,
    Json(body): Json<DriverActionRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    let driver_id = caller.driver_id()?;
    let outcome = state
        .manager
        .driver_action(driver_id, AssignmentId(assignment_id), body.action)
        .await?;
    Ok(Json(ActionResponse::from(&outcome)))
}

async fn complete_assignment(
    State(state): State<AppState>,
    caller: Caller,
    Path(assignment_id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let driver_id = caller.driver_id()?;
    state.manager.complete(driver_id, AssignmentId(assignment_id)).await?;
    Ok(Json(json!({ "message": "Assignment completed" })))
}

async fn pending_assignments(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<Vec<PendingAssignment>>, AppError> {
    let driver_id = caller.driver_id()?;
    Ok(Json(state.manager.pending_for_driver(driver_id).await?))
}
