use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{
    check_decider, validate_requested_changes, Decision, DecisionRequest, RequestAction,
    RequestListQuery, RequestStatus, METRIC_ALLOWED_FIELDS,
};
use crate::audit::{self, ChangeMap};
use crate::auth::{require_role, AuthUser, Role};
use crate::goals::{employee_owns_goal, manager_owns_goal, resolve_profile, GoalRecord};
use crate::metrics::MetricRecord;
use crate::notify::{notify_best_effort, Notification};
use crate::schema::{goals, metric_change_requests, metrics};
use crate::shared::error::ApiError;
use crate::shared::response::ApiResponse;
use crate::shared::state::AppState;

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = metric_change_requests)]
pub struct MetricChangeRequestRecord {
    pub id: Uuid,
    pub kpi_id: Uuid,
    pub kpi_name: String,
    pub kra_id: Uuid,
    pub kra_name: String,
    pub department: String,
    pub requester_role: String,
    pub requester_name: String,
    pub approver_role: String,
    pub approver_name: Option<String>,
    pub requested_changes: String,
    pub action: String,
    pub request_comment: Option<String>,
    pub status: String,
    pub decision_comment: Option<String>,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct MetricChangeRequestView {
    pub id: Uuid,
    pub kpi_id: Uuid,
    pub kpi_name: String,
    pub kra_id: Uuid,
    pub kra_name: String,
    pub department: String,
    pub requester_role: String,
    pub requester_name: String,
    pub approver_role: String,
    pub approver_name: Option<String>,
    pub requested_changes: Value,
    pub action: String,
    pub request_comment: Option<String>,
    pub status: String,
    pub decision_comment: Option<String>,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn record_to_view(record: MetricChangeRequestRecord) -> MetricChangeRequestView {
    MetricChangeRequestView {
        id: record.id,
        kpi_id: record.kpi_id,
        kpi_name: record.kpi_name,
        kra_id: record.kra_id,
        kra_name: record.kra_name,
        department: record.department,
        requester_role: record.requester_role,
        requester_name: record.requester_name,
        approver_role: record.approver_role,
        approver_name: record.approver_name,
        requested_changes: serde_json::from_str(&record.requested_changes)
            .unwrap_or(Value::Null),
        action: record.action,
        request_comment: record.request_comment,
        status: record.status,
        decision_comment: record.decision_comment,
        decided_by: record.decided_by,
        decided_at: record.decided_at,
        created_at: record.created_at,
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitMetricChangeRequest {
    pub kpi_id: Option<Uuid>,
    pub requested_changes: Option<ChangeMap>,
    pub request_comment: Option<String>,
    pub action: Option<String>,
    pub approver_name: Option<String>,
}

/// Routing rule for who decides a KPI request: Employee submissions go to
/// the parent KRA's manager (broadcast to the role when the KRA has none),
/// Manager submissions go to Admin, named only when the caller supplied a
/// specific admin.
pub(crate) fn resolve_approver(
    requester_role: Role,
    goal_manager: Option<&str>,
    supplied: Option<&str>,
) -> (Role, Option<String>) {
    match requester_role {
        Role::Employee => (Role::Manager, goal_manager.map(|s| s.to_string())),
        _ => (Role::Admin, supplied.map(|s| s.to_string())),
    }
}

fn action_phrase(action: RequestAction) -> &'static str {
    match action {
        RequestAction::Edit => "changes to",
        RequestAction::Delete => "deletion of",
    }
}

fn approver_notice(record: &MetricChangeRequestRecord, requester_role: Role) -> Option<Notification> {
    let action = RequestAction::parse(&record.action)?;
    let mut body = format!(
        "{} {} requested {} KPI \"{}\" under KRA \"{}\".",
        requester_role.display(),
        record.requester_name,
        action_phrase(action),
        record.kpi_name,
        record.kra_name
    );
    if let Some(comment) = &record.request_comment {
        body.push_str(&format!(" Comment: {}", comment));
    }
    match (&record.approver_name, Role::parse(&record.approver_role)) {
        (Some(name), _) => Some(Notification::to_name(name.clone(), "KPI change request", body)),
        (None, Some(role)) => Some(Notification::broadcast(role, "KPI change request", body)),
        (None, None) => None,
    }
}

pub async fn submit_metric_change(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<SubmitMetricChangeRequest>,
) -> Result<Json<ApiResponse<MetricChangeRequestView>>, ApiError> {
    require_role(&user, &[Role::Manager, Role::Employee])?;

    let action = match &req.action {
        Some(raw) => RequestAction::parse(raw)
            .ok_or_else(|| ApiError::Validation(format!("unknown action: {}", raw)))?,
        None => RequestAction::Edit,
    };
    let changes = req.requested_changes.clone().unwrap_or_default();
    if action == RequestAction::Edit {
        validate_requested_changes(&changes, METRIC_ALLOWED_FIELDS)?;
    }
    let kpi_id = req
        .kpi_id
        .ok_or_else(|| ApiError::Validation("kpi_id is required".to_string()))?;

    let profile = resolve_profile(&state, &user).await?;

    let changes_json =
        serde_json::to_string(&changes).map_err(|e| ApiError::Internal(e.to_string()))?;
    let pool = state.conn.clone();
    let requester_role = user.role;
    let requester = profile.clone();
    let supplied_approver = req.approver_name.clone();
    let request_comment = req.request_comment.clone();
    let record = tokio::task::spawn_blocking(
        move || -> Result<MetricChangeRequestRecord, ApiError> {
            let mut conn = pool.get()?;
            let metric = metrics::table
                .find(kpi_id)
                .select(MetricRecord::as_select())
                .first::<MetricRecord>(&mut conn)
                .optional()?
                .ok_or_else(|| ApiError::NotFound(format!("KPI {} not found", kpi_id)))?;
            let goal = goals::table
                .find(metric.goal_id)
                .select(GoalRecord::as_select())
                .first::<GoalRecord>(&mut conn)
                .optional()?
                .ok_or_else(|| {
                    ApiError::NotFound(format!("KRA {} not found", metric.goal_id))
                })?;

            match requester_role {
                Role::Employee if !employee_owns_goal(&requester, &goal) => {
                    return Err(ApiError::Forbidden(
                        "KPI's KRA is not assigned to this employee".to_string(),
                    ));
                }
                Role::Manager if !manager_owns_goal(&requester, &goal) => {
                    return Err(ApiError::Forbidden(
                        "KPI is not accessible to this manager".to_string(),
                    ));
                }
                _ => {}
            }

            let (approver_role, approver_name) = resolve_approver(
                requester_role,
                goal.manager_name.as_deref(),
                supplied_approver.as_deref(),
            );

            let record = MetricChangeRequestRecord {
                id: Uuid::new_v4(),
                kpi_id,
                kpi_name: metric.name.clone(),
                kra_id: goal.id,
                kra_name: goal.name.clone(),
                department: goal.department.clone(),
                requester_role: requester_role.as_str().to_string(),
                requester_name: requester.name.clone(),
                approver_role: approver_role.as_str().to_string(),
                approver_name,
                requested_changes: changes_json,
                action: action.as_str().to_string(),
                request_comment,
                status: RequestStatus::Pending.as_str().to_string(),
                decision_comment: None,
                decided_by: None,
                decided_at: None,
                created_at: Utc::now(),
            };
            diesel::insert_into(metric_change_requests::table)
                .values(&record)
                .execute(&mut conn)?;
            Ok(record)
        },
    )
    .await??;

    if record.approver_role == Role::Manager.as_str() && record.approver_name.is_none() {
        // likely a KRA that was never assigned a manager; keep the request
        // but make the wide delivery visible
        warn!(
            "KRA {} has no manager; request {} broadcast to all managers",
            record.kra_id, record.id
        );
    }
    info!(
        "KPI change request {} ({}) submitted by {}",
        record.id, record.action, record.requester_name
    );

    if let Some(note) = approver_notice(&record, user.role) {
        let email = match &note.recipient_name {
            Some(name) => state.directory.email_by_name(name).await.ok().flatten(),
            None => None,
        };
        notify_best_effort(state.notifier.as_ref(), note.with_email(email)).await;
    }

    Ok(Json(ApiResponse::ok(record_to_view(record))))
}

pub async fn list_metric_requests(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<RequestListQuery>,
) -> Result<Json<ApiResponse<Vec<MetricChangeRequestView>>>, ApiError> {
    require_role(&user, &[Role::Admin, Role::Manager, Role::Employee])?;
    let profile = resolve_profile(&state, &user).await?;

    let wanted_status = match &query.status {
        Some(raw) => Some(
            RequestStatus::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("unknown status: {}", raw)))?,
        ),
        None => None,
    };

    let pool = state.conn.clone();
    let role = user.role;
    let scope = query.scope.clone();
    let kra_id = query.kra_id;
    let records = tokio::task::spawn_blocking(
        move || -> Result<Vec<MetricChangeRequestRecord>, ApiError> {
            let mut conn = pool.get()?;
            let mut q = metric_change_requests::table.into_boxed();

            match role {
                // Admins see their own inbox plus role-wide broadcasts.
                Role::Admin => {
                    q = q
                        .filter(metric_change_requests::approver_role.eq(Role::Admin.as_str()))
                        .filter(
                            metric_change_requests::approver_name
                                .eq(profile.name.clone())
                                .or(metric_change_requests::approver_name.is_null()),
                        );
                }
                Role::Manager => {
                    if scope.as_deref() == Some("mine") {
                        q = q.filter(
                            metric_change_requests::requester_name.eq(profile.name.clone()),
                        );
                    } else {
                        q = q.filter(
                            metric_change_requests::approver_role.eq(Role::Manager.as_str()),
                        );
                        q = match &profile.department {
                            Some(dept) => q.filter(
                                metric_change_requests::approver_name
                                    .eq(profile.name.clone())
                                    .or(metric_change_requests::department.eq(dept.clone())),
                            ),
                            None => q.filter(
                                metric_change_requests::approver_name.eq(profile.name.clone()),
                            ),
                        };
                    }
                }
                Role::Employee => {
                    q = q
                        .filter(metric_change_requests::requester_name.eq(profile.name.clone()));
                }
            }

            if let Some(status) = wanted_status {
                q = q.filter(metric_change_requests::status.eq(status.as_str()));
            }
            if let Some(kra) = kra_id {
                q = q.filter(metric_change_requests::kra_id.eq(kra));
            }

            let records = q
                .order(metric_change_requests::created_at.desc())
                .select(MetricChangeRequestRecord::as_select())
                .load::<MetricChangeRequestRecord>(&mut conn)?;
            Ok(records)
        },
    )
    .await??;

    Ok(Json(ApiResponse::ok(
        records.into_iter().map(record_to_view).collect(),
    )))
}

async fn decide_metric_request(
    state: Arc<AppState>,
    user: AuthUser,
    id: Uuid,
    decision: Decision,
    comment: Option<String>,
) -> Result<Json<ApiResponse<MetricChangeRequestView>>, ApiError> {
    require_role(&user, &[Role::Admin, Role::Manager])?;
    let profile = resolve_profile(&state, &user).await?;

    let pool = state.conn.clone();
    let actor_role = user.role;
    let actor_name = profile.name.clone();
    let decision_comment = comment.clone();
    let record = tokio::task::spawn_blocking(
        move || -> Result<MetricChangeRequestRecord, ApiError> {
            let mut conn = pool.get()?;
            conn.transaction::<_, ApiError, _>(|conn| {
                let request = metric_change_requests::table
                    .find(id)
                    .select(MetricChangeRequestRecord::as_select())
                    .first::<MetricChangeRequestRecord>(conn)
                    .optional()?
                    .ok_or_else(|| ApiError::NotFound(format!("request {} not found", id)))?;

                if request.status != RequestStatus::Pending.as_str() {
                    return Err(ApiError::Conflict("request already decided".to_string()));
                }
                check_decider(
                    &request.approver_role,
                    request.approver_name.as_deref(),
                    actor_role,
                    &actor_name,
                )?;

                // Conditional claim: losing a race to another decider shows
                // up as zero rows here, not as a double apply.
                let claimed = diesel::update(
                    metric_change_requests::table
                        .find(id)
                        .filter(metric_change_requests::status.eq(RequestStatus::Pending.as_str())),
                )
                .set((
                    metric_change_requests::status.eq(decision.decided_status().as_str()),
                    metric_change_requests::decision_comment.eq(decision_comment.clone()),
                    metric_change_requests::decided_by.eq(Some(actor_name.clone())),
                    metric_change_requests::decided_at.eq(Some(Utc::now())),
                ))
                .execute(conn)?;
                if claimed == 0 {
                    return Err(ApiError::Conflict("request already decided".to_string()));
                }

                if decision == Decision::Approve {
                    match RequestAction::parse(&request.action) {
                        Some(RequestAction::Delete) => {
                            let deleted = diesel::delete(metrics::table.find(request.kpi_id))
                                .execute(conn)?;
                            if deleted == 0 {
                                return Err(ApiError::NotFound(format!(
                                    "KPI {} not found",
                                    request.kpi_id
                                )));
                            }
                        }
                        Some(RequestAction::Edit) => {
                            let changes: ChangeMap =
                                serde_json::from_str(&request.requested_changes).map_err(|e| {
                                    ApiError::Internal(format!(
                                        "stored requested_changes unreadable: {}",
                                        e
                                    ))
                                })?;
                            validate_requested_changes(&changes, METRIC_ALLOWED_FIELDS)?;
                            audit::record_metric_change(conn, request.kpi_id, &changes, &actor_name)?;
                        }
                        None => {
                            return Err(ApiError::Internal(format!(
                                "request has unknown action {}",
                                request.action
                            )))
                        }
                    }
                }

                let updated = metric_change_requests::table
                    .find(id)
                    .select(MetricChangeRequestRecord::as_select())
                    .first::<MetricChangeRequestRecord>(conn)?;
                Ok(updated)
            })
        },
    )
    .await??;

    info!(
        "KPI change request {} {} by {}",
        id,
        decision.past_tense(),
        profile.name
    );

    let mut body = format!(
        "Your KPI change request on \"{}\" was {} by {}.",
        record.kpi_name,
        decision.past_tense(),
        profile.name
    );
    if let Some(comment) = &record.decision_comment {
        body.push_str(&format!(" Comment: {}", comment));
    }
    let email = state
        .directory
        .email_by_name(&record.requester_name)
        .await
        .ok()
        .flatten();
    notify_best_effort(
        state.notifier.as_ref(),
        Notification::to_name(record.requester_name.clone(), "KPI change request decided", body)
            .with_email(email),
    )
    .await;

    Ok(Json(ApiResponse::ok(record_to_view(record))))
}

pub async fn approve_metric_request(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    body: Option<Json<DecisionRequest>>,
) -> Result<Json<ApiResponse<MetricChangeRequestView>>, ApiError> {
    let comment = body.and_then(|Json(d)| d.comment);
    decide_metric_request(state, user, id, Decision::Approve, comment).await
}

pub async fn reject_metric_request(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    body: Option<Json<DecisionRequest>>,
) -> Result<Json<ApiResponse<MetricChangeRequestView>>, ApiError> {
    let comment = body.and_then(|Json(d)| d.comment);
    decide_metric_request(state, user, id, Decision::Reject, comment).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn employee_requests_route_to_the_goal_manager() {
        let (role, name) = resolve_approver(Role::Employee, Some("Asha Rao"), None);
        assert_eq!(role, Role::Manager);
        assert_eq!(name.as_deref(), Some("Asha Rao"));
    }

    #[test]
    fn employee_requests_broadcast_when_goal_has_no_manager() {
        let (role, name) = resolve_approver(Role::Employee, None, Some("ignored"));
        assert_eq!(role, Role::Manager);
        // supplied approver is only honored for admin-routed requests
        assert_eq!(name, None);
    }

    #[test]
    fn manager_requests_route_to_admin() {
        let (role, name) = resolve_approver(Role::Manager, Some("Asha Rao"), None);
        assert_eq!(role, Role::Admin);
        assert_eq!(name, None);

        let (role, name) = resolve_approver(Role::Manager, None, Some("Root Admin"));
        assert_eq!(role, Role::Admin);
        assert_eq!(name.as_deref(), Some("Root Admin"));
    }

    #[test]
    fn approver_notice_broadcasts_without_a_name() {
        let record = MetricChangeRequestRecord {
            id: Uuid::new_v4(),
            kpi_id: Uuid::new_v4(),
            kpi_name: "Close 10 deals".to_string(),
            kra_id: Uuid::new_v4(),
            kra_name: "Q1 Sales".to_string(),
            department: "Sales".to_string(),
            requester_role: "employee".to_string(),
            requester_name: "Ben Ortiz".to_string(),
            approver_role: "manager".to_string(),
            approver_name: None,
            requested_changes: "{}".to_string(),
            action: "edit".to_string(),
            request_comment: Some("revised".to_string()),
            status: "Pending".to_string(),
            decision_comment: None,
            decided_by: None,
            decided_at: None,
            created_at: Utc::now(),
        };

        let note = approver_notice(&record, Role::Employee).unwrap();
        assert!(note.recipient_name.is_none());
        assert_eq!(note.recipient_role, Some(Role::Manager));
        assert!(note.body.contains("Ben Ortiz"));
        assert!(note.body.contains("Comment: revised"));

        let named = MetricChangeRequestRecord {
            approver_name: Some("Asha Rao".to_string()),
            ..record
        };
        let note = approver_notice(&named, Role::Employee).unwrap();
        assert_eq!(note.recipient_name.as_deref(), Some("Asha Rao"));
    }
}
