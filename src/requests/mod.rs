//! Change-request workflow: submission, visibility scopes, and the
//! Pending -> Approved/Rejected decision step for both entity kinds.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::audit::ChangeMap;
use crate::auth::Role;
use crate::shared::error::ApiError;
use crate::shared::state::AppState;

pub mod kpi;
pub mod kra;

/// Fields a KPI change request may touch. `def` is the wire name for the
/// definition column.
pub const METRIC_ALLOWED_FIELDS: &[&str] = &["name", "def", "due_date", "scoring_method", "target"];

/// Fields a KRA change request may touch, plus the deletion sentinel.
pub const GOAL_ALLOWED_FIELDS: &[&str] = &[
    "name",
    "definition",
    "target",
    "manager_name",
    "employee_name",
    DELETE_SENTINEL,
];

/// Goal requests carry deletion as `_action: "delete"` inside
/// `requested_changes` instead of a separate action column.
pub const DELETE_SENTINEL: &str = "_action";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "Pending",
            RequestStatus::Approved => "Approved",
            RequestStatus::Rejected => "Rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<RequestStatus> {
        match raw.trim().to_lowercase().as_str() {
            "pending" => Some(RequestStatus::Pending),
            "approved" => Some(RequestStatus::Approved),
            "rejected" => Some(RequestStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    Edit,
    Delete,
}

impl RequestAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestAction::Edit => "edit",
            RequestAction::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<RequestAction> {
        match raw.trim().to_lowercase().as_str() {
            "edit" => Some(RequestAction::Edit),
            "delete" => Some(RequestAction::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn decided_status(&self) -> RequestStatus {
        match self {
            Decision::Approve => RequestStatus::Approved,
            Decision::Reject => RequestStatus::Rejected,
        }
    }

    pub fn past_tense(&self) -> &'static str {
        match self {
            Decision::Approve => "approved",
            Decision::Reject => "rejected",
        }
    }
}

/// Submission-time and approval-time guard: every requested key must sit on
/// the entity's allow-list, and an edit payload may not be empty.
pub fn validate_requested_changes(changes: &ChangeMap, allowed: &[&str]) -> Result<(), ApiError> {
    if changes.is_empty() {
        return Err(ApiError::Validation(
            "requested_changes must not be empty".to_string(),
        ));
    }
    for key in changes.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(ApiError::Validation(format!(
                "field {} may not be requested",
                key
            )));
        }
    }
    Ok(())
}

/// Approver gate: the decider's role must equal the request's approver
/// role, and when the request names a specific approver only that exact
/// name may decide. Broadcast rows (no name) accept any holder of the role.
pub fn check_decider(
    approver_role: &str,
    approver_name: Option<&str>,
    actor_role: Role,
    actor_name: &str,
) -> Result<(), ApiError> {
    let required = Role::parse(approver_role).ok_or_else(|| {
        ApiError::Internal(format!("request has unknown approver role {}", approver_role))
    })?;
    if actor_role != required {
        return Err(ApiError::Forbidden(format!(
            "request awaits a {} decision",
            required
        )));
    }
    if let Some(required_name) = approver_name {
        if required_name != actor_name {
            return Err(ApiError::Forbidden(
                "request is addressed to a different approver".to_string(),
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RequestListQuery {
    pub scope: Option<String>,
    pub status: Option<String>,
    pub kra_id: Option<Uuid>,
}

pub fn configure_request_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/requests/kpi-change", post(kpi::submit_metric_change))
        .route("/requests/kra-change", post(kra::submit_goal_change))
        .route("/requests", get(kpi::list_metric_requests))
        .route("/requests/kra", get(kra::list_goal_requests))
        .route("/requests/kra/:id/approve", post(kra::approve_goal_request))
        .route("/requests/kra/:id/reject", post(kra::reject_goal_request))
        .route("/requests/:id/approve", post(kpi::approve_metric_request))
        .route("/requests/:id/reject", post(kpi::reject_metric_request))
}
