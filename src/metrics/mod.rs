use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::audit::{self, ChangeMap};
use crate::auth::{require_role, AuthUser, Role};
use crate::goals::{employee_owns_goal, manager_owns_goal, resolve_profile, GoalRecord};
use crate::schema::{goals, metric_logs, metrics};
use crate::shared::error::ApiError;
use crate::shared::response::ApiResponse;
use crate::shared::state::AppState;
use crate::shared::utils::today_local;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricStatus {
    Active,
    End,
}

impl MetricStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricStatus::Active => "Active",
            MetricStatus::End => "End",
        }
    }
}

/// A KPI stays Active through its due date and flips to End the day after.
/// No due date means it never expires on its own.
pub fn derive_metric_status(due_date: Option<&NaiveDate>, today: NaiveDate) -> MetricStatus {
    match due_date {
        Some(due) if *due < today => MetricStatus::End,
        _ => MetricStatus::Active,
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = metrics)]
#[diesel(treat_none_as_null = true)]
pub struct MetricRecord {
    pub id: Uuid,
    pub goal_id: Uuid,
    pub name: String,
    pub definition: String,
    pub due_date: Option<NaiveDate>,
    pub scoring_method: String,
    pub target: Option<BigDecimal>,
    pub score: Option<BigDecimal>,
    pub comments: Option<String>,
    pub status: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    pub id: Uuid,
    pub goal_id: Uuid,
    pub name: String,
    pub definition: String,
    pub due_date: Option<NaiveDate>,
    pub scoring_method: String,
    pub target: Option<f64>,
    pub score: Option<f64>,
    pub comments: Option<String>,
    pub status: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

pub fn record_to_metric(record: MetricRecord) -> Metric {
    Metric {
        id: record.id,
        goal_id: record.goal_id,
        name: record.name,
        definition: record.definition,
        due_date: record.due_date,
        scoring_method: record.scoring_method,
        target: record.target.as_ref().and_then(|d| d.to_f64()),
        score: record.score.as_ref().and_then(|d| d.to_f64()),
        comments: record.comments,
        status: record.status,
        created_by: record.created_by,
        created_at: record.created_at,
    }
}

#[derive(Debug, Serialize)]
pub struct MetricLogView {
    pub id: Uuid,
    pub kpi_id: Uuid,
    pub version: i32,
    pub name: String,
    pub definition: String,
    pub due_date: Option<NaiveDate>,
    pub scoring_method: String,
    pub target: Option<f64>,
    pub score: Option<f64>,
    pub comments: Option<String>,
    pub status: String,
    pub goal_id: Uuid,
    pub goal_name: String,
    pub department: String,
    pub created_by: String,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
    pub changes: Option<Value>,
}

fn log_to_view(log: audit::MetricLogRecord) -> MetricLogView {
    MetricLogView {
        id: log.id,
        kpi_id: log.kpi_id,
        version: log.version,
        name: log.name,
        definition: log.definition,
        due_date: log.due_date,
        scoring_method: log.scoring_method,
        target: log.target.as_ref().and_then(|d| d.to_f64()),
        score: log.score.as_ref().and_then(|d| d.to_f64()),
        comments: log.comments,
        status: log.status,
        goal_id: log.goal_id,
        goal_name: log.goal_name,
        department: log.department,
        created_by: log.created_by,
        updated_by: log.updated_by,
        updated_at: log.updated_at,
        changes: audit::parse_changes(log.changes.as_deref()),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateMetricRequest {
    pub kra_id: Option<Uuid>,
    pub name: Option<String>,
    #[serde(alias = "definition")]
    pub def: Option<String>,
    pub scoring_method: Option<String>,
    pub due_date: Option<String>,
    pub target: Option<f64>,
    pub comments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMetricRequest {
    pub name: Option<String>,
    #[serde(alias = "definition")]
    pub def: Option<String>,
    pub due_date: Option<String>,
    pub scoring_method: Option<String>,
    pub target: Option<f64>,
    pub score: Option<f64>,
    pub comments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MetricQuery {
    pub kra_id: Option<Uuid>,
    pub dept: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MetricLogQuery {
    pub kpi_id: Option<Uuid>,
    pub kra_id: Option<Uuid>,
    pub dept: Option<String>,
}

fn update_to_changes(req: &UpdateMetricRequest) -> ChangeMap {
    let mut changes = ChangeMap::new();
    if let Some(v) = &req.name {
        changes.insert("name".to_string(), json!(v));
    }
    if let Some(v) = &req.def {
        changes.insert("def".to_string(), json!(v));
    }
    if let Some(v) = &req.due_date {
        changes.insert("due_date".to_string(), json!(v));
    }
    if let Some(v) = &req.scoring_method {
        changes.insert("scoring_method".to_string(), json!(v));
    }
    if let Some(v) = req.target {
        changes.insert("target".to_string(), json!(v));
    }
    if let Some(v) = req.score {
        changes.insert("score".to_string(), json!(v));
    }
    if let Some(v) = &req.comments {
        changes.insert("comments".to_string(), json!(v));
    }
    changes
}

fn load_goal(conn: &mut PgConnection, id: Uuid) -> Result<GoalRecord, ApiError> {
    goals::table
        .find(id)
        .select(GoalRecord::as_select())
        .first::<GoalRecord>(conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound(format!("KRA {} not found", id)))
}

fn load_metric(conn: &mut PgConnection, id: Uuid) -> Result<MetricRecord, ApiError> {
    metrics::table
        .find(id)
        .select(MetricRecord::as_select())
        .first::<MetricRecord>(conn)
        .optional()?
        .ok_or_else(|| ApiError::NotFound(format!("KPI {} not found", id)))
}

pub async fn create_metric(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateMetricRequest>,
) -> Result<Json<ApiResponse<Metric>>, ApiError> {
    require_role(&user, &[Role::Admin, Role::Manager, Role::Employee])?;

    let kra_id = req
        .kra_id
        .ok_or_else(|| ApiError::Validation("kra_id is required".to_string()))?;
    let name = req
        .name
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::Validation("name is required".to_string()))?
        .to_string();
    let definition = req
        .def
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::Validation("def is required".to_string()))?
        .to_string();
    let scoring_method = req
        .scoring_method
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::Validation("scoring_method is required".to_string()))?
        .to_string();
    let due_date = match &req.due_date {
        Some(raw) => audit::value_to_date("due_date", &Value::String(raw.clone()))?,
        None => None,
    };
    let target = req
        .target
        .map(|v| audit::decimal_from_f64("target", v))
        .transpose()?;

    let profile = resolve_profile(&state, &user).await?;

    let record = MetricRecord {
        id: Uuid::new_v4(),
        goal_id: kra_id,
        name,
        definition,
        due_date,
        scoring_method,
        target,
        score: None,
        comments: req.comments.clone(),
        status: derive_metric_status(due_date.as_ref(), today_local())
            .as_str()
            .to_string(),
        created_by: profile.name.clone(),
        created_at: Utc::now(),
    };

    let pool = state.conn.clone();
    let actor = profile.name.clone();
    let actor_role = user.role;
    let profile_for_check = profile.clone();
    let saved = tokio::task::spawn_blocking(move || -> Result<MetricRecord, ApiError> {
        let mut conn = pool.get()?;
        let goal = load_goal(&mut conn, kra_id)?;
        match actor_role {
            Role::Employee if !employee_owns_goal(&profile_for_check, &goal) => {
                return Err(ApiError::Forbidden(
                    "KRA is not assigned to this employee".to_string(),
                ));
            }
            Role::Manager if !manager_owns_goal(&profile_for_check, &goal) => {
                return Err(ApiError::Forbidden(
                    "KRA is not accessible to this manager".to_string(),
                ));
            }
            _ => {}
        }
        audit::record_metric_creation(&mut conn, &record, &actor)?;
        Ok(record)
    })
    .await??;

    info!("created KPI {} under KRA {}", saved.id, kra_id);
    Ok(Json(ApiResponse::ok(record_to_metric(saved))))
}

pub async fn list_metrics(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<MetricQuery>,
) -> Result<Json<ApiResponse<Vec<Metric>>>, ApiError> {
    require_role(&user, &[Role::Admin, Role::Manager, Role::Employee])?;
    let profile = resolve_profile(&state, &user).await?;

    let pool = state.conn.clone();
    let role = user.role;
    let records = tokio::task::spawn_blocking(move || -> Result<Vec<MetricRecord>, ApiError> {
        let mut conn = pool.get()?;

        let mut goal_query = goals::table.into_boxed();
        match role {
            Role::Employee => {
                goal_query = goal_query.filter(goals::employee_name.eq(profile.name.clone()));
            }
            Role::Manager => match &profile.department {
                Some(dept) => {
                    goal_query = goal_query.filter(goals::department.eq(dept.clone()));
                }
                None => return Ok(Vec::new()),
            },
            Role::Admin => {
                if let Some(dept) = &query.dept {
                    goal_query = goal_query.filter(goals::department.eq(dept.clone()));
                }
            }
        }
        if let Some(kra_id) = query.kra_id {
            goal_query = goal_query.filter(goals::id.eq(kra_id));
        }
        let goal_ids: Vec<Uuid> = goal_query.select(goals::id).load::<Uuid>(&mut conn)?;

        let records = metrics::table
            .filter(metrics::goal_id.eq_any(goal_ids))
            .order(metrics::created_at.desc())
            .select(MetricRecord::as_select())
            .load::<MetricRecord>(&mut conn)?;
        Ok(records)
    })
    .await??;

    Ok(Json(ApiResponse::ok(
        records.into_iter().map(record_to_metric).collect(),
    )))
}

pub async fn get_metric(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Metric>>, ApiError> {
    require_role(&user, &[Role::Admin, Role::Manager, Role::Employee])?;
    let profile = resolve_profile(&state, &user).await?;

    let pool = state.conn.clone();
    let role = user.role;
    let record = tokio::task::spawn_blocking(move || -> Result<MetricRecord, ApiError> {
        let mut conn = pool.get()?;
        let record = load_metric(&mut conn, id)?;
        let goal = load_goal(&mut conn, record.goal_id)?;
        match role {
            Role::Employee if !employee_owns_goal(&profile, &goal) => Err(ApiError::Forbidden(
                "KPI belongs to another employee".to_string(),
            )),
            Role::Manager if !manager_owns_goal(&profile, &goal) => Err(ApiError::Forbidden(
                "KPI belongs to another department".to_string(),
            )),
            _ => Ok(record),
        }
    })
    .await??;

    Ok(Json(ApiResponse::ok(record_to_metric(record))))
}

pub async fn update_metric(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateMetricRequest>,
) -> Result<Json<ApiResponse<Metric>>, ApiError> {
    require_role(&user, &[Role::Admin, Role::Manager])?;
    let profile = resolve_profile(&state, &user).await?;

    let changes = update_to_changes(&req);
    let pool = state.conn.clone();
    let role = user.role;
    let actor = profile.name.clone();
    let record = tokio::task::spawn_blocking(move || -> Result<MetricRecord, ApiError> {
        let mut conn = pool.get()?;
        if role == Role::Manager {
            let current = load_metric(&mut conn, id)?;
            let goal = load_goal(&mut conn, current.goal_id)?;
            if !manager_owns_goal(&profile, &goal) {
                return Err(ApiError::Forbidden(
                    "KPI belongs to another department".to_string(),
                ));
            }
        }
        audit::record_metric_change(&mut conn, id, &changes, &actor)
    })
    .await??;

    info!("KPI {} updated by {}", id, user.name);
    Ok(Json(ApiResponse::ok(record_to_metric(record))))
}

pub async fn delete_metric(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    require_role(&user, &[Role::Admin, Role::Manager])?;

    let needs_ownership = user.role == Role::Manager;
    let profile = if needs_ownership {
        Some(resolve_profile(&state, &user).await?)
    } else {
        None
    };

    let pool = state.conn.clone();
    let deleted = tokio::task::spawn_blocking(move || -> Result<usize, ApiError> {
        let mut conn = pool.get()?;
        let record = load_metric(&mut conn, id)?;
        if let Some(profile) = profile {
            let goal = load_goal(&mut conn, record.goal_id)?;
            if !manager_owns_goal(&profile, &goal) {
                return Err(ApiError::Forbidden(
                    "KPI belongs to another department".to_string(),
                ));
            }
        }
        let deleted = diesel::delete(metrics::table.find(id)).execute(&mut conn)?;
        Ok(deleted)
    })
    .await??;

    if deleted == 0 {
        return Err(ApiError::NotFound(format!("KPI {} not found", id)));
    }
    info!("KPI {} deleted by {}", id, user.name);
    Ok(Json(ApiResponse::message("KPI deleted")))
}

pub async fn list_metric_logs(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<MetricLogQuery>,
) -> Result<Json<ApiResponse<Vec<MetricLogView>>>, ApiError> {
    require_role(&user, &[Role::Admin, Role::Manager])?;

    let forced_dept = if user.role == Role::Manager {
        let profile = resolve_profile(&state, &user).await?;
        match profile.department {
            Some(dept) => Some(dept),
            None => return Ok(Json(ApiResponse::ok(Vec::new()))),
        }
    } else {
        query.dept.clone()
    };

    let pool = state.conn.clone();
    let logs = tokio::task::spawn_blocking(
        move || -> Result<Vec<audit::MetricLogRecord>, ApiError> {
            let mut conn = pool.get()?;
            let mut q = metric_logs::table.into_boxed();
            if let Some(dept) = forced_dept {
                q = q.filter(metric_logs::department.eq(dept));
            }
            if let Some(kpi_id) = query.kpi_id {
                q = q.filter(metric_logs::kpi_id.eq(kpi_id));
            }
            if let Some(kra_id) = query.kra_id {
                q = q.filter(metric_logs::goal_id.eq(kra_id));
            }
            let logs = q
                .order(metric_logs::updated_at.desc())
                .select(audit::MetricLogRecord::as_select())
                .load::<audit::MetricLogRecord>(&mut conn)?;
            Ok(logs)
        },
    )
    .await??;

    Ok(Json(ApiResponse::ok(
        logs.into_iter().map(log_to_view).collect(),
    )))
}

pub fn configure_metric_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/kpi/create", post(create_metric))
        .route("/kpi", get(list_metrics))
        .route("/kpi/logs", get(list_metric_logs))
        .route("/kpi/:id", get(get_metric).delete(delete_metric))
        .route("/kpi/:id/update", post(update_metric))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn status_flips_only_after_the_due_date() {
        let today = date(2026, 8, 20);
        assert_eq!(
            derive_metric_status(Some(&date(2026, 8, 19)), today),
            MetricStatus::End
        );
        assert_eq!(
            derive_metric_status(Some(&date(2026, 8, 20)), today),
            MetricStatus::Active
        );
        assert_eq!(
            derive_metric_status(Some(&date(2026, 8, 21)), today),
            MetricStatus::Active
        );
        assert_eq!(derive_metric_status(None, today), MetricStatus::Active);
    }

    #[test]
    fn update_request_uses_wire_field_names() {
        let req = UpdateMetricRequest {
            name: None,
            def: Some("Reworded".to_string()),
            due_date: Some("2026-12-01".to_string()),
            scoring_method: None,
            target: None,
            score: Some(55.0),
            comments: None,
        };
        let changes = update_to_changes(&req);
        assert_eq!(changes.len(), 3);
        assert_eq!(changes["def"], json!("Reworded"));
        assert_eq!(changes["due_date"], json!("2026-12-01"));
        assert_eq!(changes["score"], json!(55.0));
    }

    #[test]
    fn definition_alias_still_deserializes() {
        let req: UpdateMetricRequest =
            serde_json::from_str(r#"{"definition": "via alias"}"#).unwrap();
        assert_eq!(req.def.as_deref(), Some("via alias"));
    }
}
