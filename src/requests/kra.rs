use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::kpi::resolve_approver;
use super::{
    check_decider, validate_requested_changes, Decision, DecisionRequest, RequestAction,
    RequestListQuery, RequestStatus, DELETE_SENTINEL, GOAL_ALLOWED_FIELDS,
};
use crate::audit::{self, ChangeMap};
use crate::auth::{require_role, AuthUser, Role};
use crate::goals::{manager_owns_goal, resolve_profile, GoalRecord};
use crate::notify::{notify_best_effort, Notification};
use crate::schema::{goal_change_requests, goals};
use crate::shared::error::ApiError;
use crate::shared::response::ApiResponse;
use crate::shared::state::AppState;

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = goal_change_requests)]
pub struct GoalChangeRequestRecord {
    pub id: Uuid,
    pub kra_id: Uuid,
    pub kra_name: String,
    pub department: String,
    pub requester_role: String,
    pub requester_name: String,
    pub approver_role: String,
    pub approver_name: Option<String>,
    pub requested_changes: String,
    pub request_comment: Option<String>,
    pub status: String,
    pub decision_comment: Option<String>,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct GoalChangeRequestView {
    pub id: Uuid,
    pub kra_id: Uuid,
    pub kra_name: String,
    pub department: String,
    pub requester_role: String,
    pub requester_name: String,
    pub approver_role: String,
    pub approver_name: Option<String>,
    pub requested_changes: Value,
    pub request_comment: Option<String>,
    pub status: String,
    pub decision_comment: Option<String>,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn record_to_view(record: GoalChangeRequestRecord) -> GoalChangeRequestView {
    GoalChangeRequestView {
        id: record.id,
        kra_id: record.kra_id,
        kra_name: record.kra_name,
        department: record.department,
        requester_role: record.requester_role,
        requester_name: record.requester_name,
        approver_role: record.approver_role,
        approver_name: record.approver_name,
        requested_changes: serde_json::from_str(&record.requested_changes)
            .unwrap_or(Value::Null),
        request_comment: record.request_comment,
        status: record.status,
        decision_comment: record.decision_comment,
        decided_by: record.decided_by,
        decided_at: record.decided_at,
        created_at: record.created_at,
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitGoalChangeRequest {
    pub kra_id: Option<Uuid>,
    pub requested_changes: Option<ChangeMap>,
    pub request_comment: Option<String>,
    pub approver_name: Option<String>,
}

/// True when the payload carries the deletion sentinel with the value
/// `delete` (any casing).
pub(crate) fn is_delete_request(changes: &ChangeMap) -> bool {
    matches!(
        changes.get(DELETE_SENTINEL),
        Some(Value::String(s)) if RequestAction::parse(s) == Some(RequestAction::Delete)
    )
}

fn validate_goal_changes(changes: &ChangeMap) -> Result<(), ApiError> {
    validate_requested_changes(changes, GOAL_ALLOWED_FIELDS)?;
    if changes.contains_key(DELETE_SENTINEL) && !is_delete_request(changes) {
        return Err(ApiError::Validation(format!(
            "{} only accepts \"delete\"",
            DELETE_SENTINEL
        )));
    }
    Ok(())
}

fn approver_notice(record: &GoalChangeRequestRecord) -> Notification {
    let deletion = serde_json::from_str::<ChangeMap>(&record.requested_changes)
        .map(|changes| is_delete_request(&changes))
        .unwrap_or(false);
    let phrase = if deletion { "deletion of" } else { "changes to" };
    let mut body = format!(
        "Manager {} requested {} KRA \"{}\" in {}.",
        record.requester_name, phrase, record.kra_name, record.department
    );
    if let Some(comment) = &record.request_comment {
        body.push_str(&format!(" Comment: {}", comment));
    }
    match &record.approver_name {
        Some(name) => Notification::to_name(name.clone(), "KRA change request", body),
        None => Notification::broadcast(Role::Admin, "KRA change request", body),
    }
}

pub async fn submit_goal_change(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<SubmitGoalChangeRequest>,
) -> Result<Json<ApiResponse<GoalChangeRequestView>>, ApiError> {
    require_role(&user, &[Role::Manager])?;

    let changes = req.requested_changes.clone().unwrap_or_default();
    validate_goal_changes(&changes)?;
    let kra_id = req
        .kra_id
        .ok_or_else(|| ApiError::Validation("kra_id is required".to_string()))?;

    let profile = resolve_profile(&state, &user).await?;

    let changes_json =
        serde_json::to_string(&changes).map_err(|e| ApiError::Internal(e.to_string()))?;
    let pool = state.conn.clone();
    let requester = profile.clone();
    let supplied_approver = req.approver_name.clone();
    let request_comment = req.request_comment.clone();
    let record = tokio::task::spawn_blocking(
        move || -> Result<GoalChangeRequestRecord, ApiError> {
            let mut conn = pool.get()?;
            let goal = goals::table
                .find(kra_id)
                .select(GoalRecord::as_select())
                .first::<GoalRecord>(&mut conn)
                .optional()?
                .ok_or_else(|| ApiError::NotFound(format!("KRA {} not found", kra_id)))?;

            if !manager_owns_goal(&requester, &goal) {
                return Err(ApiError::Forbidden(
                    "KRA is not accessible to this manager".to_string(),
                ));
            }

            let (approver_role, approver_name) =
                resolve_approver(Role::Manager, goal.manager_name.as_deref(), supplied_approver.as_deref());

            let record = GoalChangeRequestRecord {
                id: Uuid::new_v4(),
                kra_id,
                kra_name: goal.name.clone(),
                department: goal.department.clone(),
                requester_role: Role::Manager.as_str().to_string(),
                requester_name: requester.name.clone(),
                approver_role: approver_role.as_str().to_string(),
                approver_name,
                requested_changes: changes_json,
                request_comment,
                status: RequestStatus::Pending.as_str().to_string(),
                decision_comment: None,
                decided_by: None,
                decided_at: None,
                created_at: Utc::now(),
            };
            diesel::insert_into(goal_change_requests::table)
                .values(&record)
                .execute(&mut conn)?;
            Ok(record)
        },
    )
    .await??;

    info!(
        "KRA change request {} submitted by {} for KRA {}",
        record.id, record.requester_name, record.kra_id
    );

    let note = approver_notice(&record);
    let email = match &note.recipient_name {
        Some(name) => state.directory.email_by_name(name).await.ok().flatten(),
        None => None,
    };
    notify_best_effort(state.notifier.as_ref(), note.with_email(email)).await;

    Ok(Json(ApiResponse::ok(record_to_view(record))))
}

pub async fn list_goal_requests(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<RequestListQuery>,
) -> Result<Json<ApiResponse<Vec<GoalChangeRequestView>>>, ApiError> {
    require_role(&user, &[Role::Admin, Role::Manager])?;
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
    let kra_id = query.kra_id;
    let records = tokio::task::spawn_blocking(
        move || -> Result<Vec<GoalChangeRequestRecord>, ApiError> {
            let mut conn = pool.get()?;
            let mut q = goal_change_requests::table.into_boxed();

            match role {
                Role::Admin => {
                    q = q
                        .filter(goal_change_requests::approver_role.eq(Role::Admin.as_str()))
                        .filter(
                            goal_change_requests::approver_name
                                .eq(profile.name.clone())
                                .or(goal_change_requests::approver_name.is_null()),
                        );
                }
                // Managers only ever submit KRA requests, so their view is
                // always their own submissions.
                _ => {
                    q = q.filter(goal_change_requests::requester_name.eq(profile.name.clone()));
                }
            }

            if let Some(status) = wanted_status {
                q = q.filter(goal_change_requests::status.eq(status.as_str()));
            }
            if let Some(kra) = kra_id {
                q = q.filter(goal_change_requests::kra_id.eq(kra));
            }

            let records = q
                .order(goal_change_requests::created_at.desc())
                .select(GoalChangeRequestRecord::as_select())
                .load::<GoalChangeRequestRecord>(&mut conn)?;
            Ok(records)
        },
    )
    .await??;

    Ok(Json(ApiResponse::ok(
        records.into_iter().map(record_to_view).collect(),
    )))
}

async fn decide_goal_request(
    state: Arc<AppState>,
    user: AuthUser,
    id: Uuid,
    decision: Decision,
    comment: Option<String>,
) -> Result<Json<ApiResponse<GoalChangeRequestView>>, ApiError> {
    require_role(&user, &[Role::Admin])?;
    let profile = resolve_profile(&state, &user).await?;

    let pool = state.conn.clone();
    let actor_role = user.role;
    let actor_name = profile.name.clone();
    let decision_comment = comment.clone();
    let record = tokio::task::spawn_blocking(
        move || -> Result<GoalChangeRequestRecord, ApiError> {
            let mut conn = pool.get()?;
            conn.transaction::<_, ApiError, _>(|conn| {
                let request = goal_change_requests::table
                    .find(id)
                    .select(GoalChangeRequestRecord::as_select())
                    .first::<GoalChangeRequestRecord>(conn)
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

                let claimed = diesel::update(
                    goal_change_requests::table
                        .find(id)
                        .filter(goal_change_requests::status.eq(RequestStatus::Pending.as_str())),
                )
                .set((
                    goal_change_requests::status.eq(decision.decided_status().as_str()),
                    goal_change_requests::decision_comment.eq(decision_comment.clone()),
                    goal_change_requests::decided_by.eq(Some(actor_name.clone())),
                    goal_change_requests::decided_at.eq(Some(Utc::now())),
                ))
                .execute(conn)?;
                if claimed == 0 {
                    return Err(ApiError::Conflict("request already decided".to_string()));
                }

                if decision == Decision::Approve {
                    let changes: ChangeMap = serde_json::from_str(&request.requested_changes)
                        .map_err(|e| {
                            ApiError::Internal(format!(
                                "stored requested_changes unreadable: {}",
                                e
                            ))
                        })?;
                    if is_delete_request(&changes) {
                        // cascades to the KRA's KPIs and both log tables
                        let deleted =
                            diesel::delete(goals::table.find(request.kra_id)).execute(conn)?;
                        if deleted == 0 {
                            return Err(ApiError::NotFound(format!(
                                "KRA {} not found",
                                request.kra_id
                            )));
                        }
                    } else {
                        validate_goal_changes(&changes)?;
                        audit::record_goal_change(conn, request.kra_id, &changes, &actor_name)?;
                    }
                }

                let updated = goal_change_requests::table
                    .find(id)
                    .select(GoalChangeRequestRecord::as_select())
                    .first::<GoalChangeRequestRecord>(conn)?;
                Ok(updated)
            })
        },
    )
    .await??;

    info!(
        "KRA change request {} {} by {}",
        id,
        decision.past_tense(),
        profile.name
    );

    let mut body = format!(
        "Your KRA change request on \"{}\" was {} by {}.",
        record.kra_name,
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
        Notification::to_name(record.requester_name.clone(), "KRA change request decided", body)
            .with_email(email),
    )
    .await;

    Ok(Json(ApiResponse::ok(record_to_view(record))))
}

pub async fn approve_goal_request(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    body: Option<Json<DecisionRequest>>,
) -> Result<Json<ApiResponse<GoalChangeRequestView>>, ApiError> {
    let comment = body.and_then(|Json(d)| d.comment);
    decide_goal_request(state, user, id, Decision::Approve, comment).await
}

pub async fn reject_goal_request(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    body: Option<Json<DecisionRequest>>,
) -> Result<Json<ApiResponse<GoalChangeRequestView>>, ApiError> {
    let comment = body.and_then(|Json(d)| d.comment);
    decide_goal_request(state, user, id, Decision::Reject, comment).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, Value)]) -> ChangeMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn delete_sentinel_is_detected() {
        assert!(is_delete_request(&map(&[(DELETE_SENTINEL, json!("delete"))])));
        assert!(is_delete_request(&map(&[(DELETE_SENTINEL, json!("Delete"))])));
        assert!(!is_delete_request(&map(&[(DELETE_SENTINEL, json!("edit"))])));
        assert!(!is_delete_request(&map(&[("name", json!("delete"))])));
        assert!(!is_delete_request(&map(&[(DELETE_SENTINEL, json!(1))])));
    }

    #[test]
    fn sentinel_with_other_values_fails_validation() {
        let err = validate_goal_changes(&map(&[(DELETE_SENTINEL, json!("archive"))]));
        assert!(matches!(err, Err(ApiError::Validation(_))));

        assert!(validate_goal_changes(&map(&[(DELETE_SENTINEL, json!("delete"))])).is_ok());
        assert!(validate_goal_changes(&map(&[
            ("name", json!("Q2 Sales")),
            ("target", json!(80))
        ]))
        .is_ok());
    }

    #[test]
    fn notice_addresses_named_admin_or_broadcasts() {
        let record = GoalChangeRequestRecord {
            id: Uuid::new_v4(),
            kra_id: Uuid::new_v4(),
            kra_name: "Q1 Sales".to_string(),
            department: "Sales".to_string(),
            requester_role: "manager".to_string(),
            requester_name: "Asha Rao".to_string(),
            approver_role: "admin".to_string(),
            approver_name: None,
            requested_changes: r#"{"_action":"delete"}"#.to_string(),
            request_comment: None,
            status: "Pending".to_string(),
            decision_comment: None,
            decided_by: None,
            decided_at: None,
            created_at: Utc::now(),
        };

        let note = approver_notice(&record);
        assert!(note.recipient_name.is_none());
        assert_eq!(note.recipient_role, Some(Role::Admin));
        assert!(note.body.contains("deletion of"));

        let named = GoalChangeRequestRecord {
            approver_name: Some("Root Admin".to_string()),
            requested_changes: r#"{"target":90}"#.to_string(),
            ..record
        };
        let note = approver_notice(&named);
        assert_eq!(note.recipient_name.as_deref(), Some("Root Admin"));
        assert!(note.body.contains("changes to"));
    }
}
