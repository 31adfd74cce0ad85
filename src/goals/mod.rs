use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::audit::{self, ChangeMap};
use crate::auth::{require_role, AuthUser, Role};
use crate::directory::UserProfile;
use crate::notify::{notify_best_effort, Notification};
use crate::schema::{goal_logs, goals};
use crate::shared::error::ApiError;
use crate::shared::response::ApiResponse;
use crate::shared::state::AppState;

/// Sentinel assignment value that triggers fan-out creation.
const ALL_SENTINEL: &str = "all";

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = goals)]
#[diesel(treat_none_as_null = true)]
pub struct GoalRecord {
    pub id: Uuid,
    pub name: String,
    pub definition: String,
    pub department: String,
    pub manager_name: Option<String>,
    pub employee_name: Option<String>,
    pub created_by: String,
    pub scoring_method: String,
    pub target: Option<BigDecimal>,
    pub overall_score: Option<BigDecimal>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Goal {
    pub id: Uuid,
    pub name: String,
    pub definition: String,
    pub department: String,
    pub manager_name: Option<String>,
    pub employee_name: Option<String>,
    pub created_by: String,
    pub scoring_method: String,
    pub target: Option<f64>,
    pub overall_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

pub fn record_to_goal(record: GoalRecord) -> Goal {
    Goal {
        id: record.id,
        name: record.name,
        definition: record.definition,
        department: record.department,
        manager_name: record.manager_name,
        employee_name: record.employee_name,
        created_by: record.created_by,
        scoring_method: record.scoring_method,
        target: record.target.as_ref().and_then(|d| d.to_f64()),
        overall_score: record.overall_score.as_ref().and_then(|d| d.to_f64()),
        created_at: record.created_at,
    }
}

#[derive(Debug, Serialize)]
pub struct GoalLogView {
    pub id: Uuid,
    pub goal_id: Uuid,
    pub version: i32,
    pub name: String,
    pub definition: String,
    pub department: String,
    pub manager_name: Option<String>,
    pub employee_name: Option<String>,
    pub created_by: String,
    pub scoring_method: String,
    pub target: Option<f64>,
    pub overall_score: Option<f64>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
    pub changes: Option<Value>,
}

fn log_to_view(log: audit::GoalLogRecord) -> GoalLogView {
    GoalLogView {
        id: log.id,
        goal_id: log.goal_id,
        version: log.version,
        name: log.name,
        definition: log.definition,
        department: log.department,
        manager_name: log.manager_name,
        employee_name: log.employee_name,
        created_by: log.created_by,
        scoring_method: log.scoring_method,
        target: log.target.as_ref().and_then(|d| d.to_f64()),
        overall_score: log.overall_score.as_ref().and_then(|d| d.to_f64()),
        updated_by: log.updated_by,
        updated_at: log.updated_at,
        changes: audit::parse_changes(log.changes.as_deref()),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateGoalRequest {
    pub name: Option<String>,
    pub definition: Option<String>,
    pub scoring_method: Option<String>,
    pub target: Option<f64>,
    pub dept: Option<String>,
    pub manager_name: Option<String>,
    pub employee_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateGoalRequest {
    pub name: Option<String>,
    pub definition: Option<String>,
    pub target: Option<f64>,
    pub manager_name: Option<String>,
    pub employee_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AssignGoalRequest {
    pub manager_name: Option<String>,
    pub employee_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GoalLogQuery {
    pub dept: Option<String>,
    pub manager: Option<String>,
    pub employee: Option<String>,
    pub kra_id: Option<Uuid>,
}

/// Creation returns one goal normally and an array on fan-out; clients
/// handle both shapes.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum GoalCreation {
    Single(Goal),
    Many(Vec<Goal>),
}

fn is_all(value: Option<&str>) -> bool {
    value.map(|v| v.trim().eq_ignore_ascii_case(ALL_SENTINEL)) == Some(true)
}

fn required_field(value: &Option<String>, field: &str) -> Result<String, ApiError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ApiError::Validation(format!("{} is required", field))),
    }
}

/// Shared column values for every row a single create call produces.
struct GoalSeed {
    name: String,
    definition: String,
    scoring_method: String,
    target: Option<BigDecimal>,
    department: String,
    created_by: String,
}

fn build_goal(
    seed: &GoalSeed,
    manager_name: Option<String>,
    employee_name: Option<String>,
) -> GoalRecord {
    GoalRecord {
        id: Uuid::new_v4(),
        name: seed.name.clone(),
        definition: seed.definition.clone(),
        department: seed.department.clone(),
        manager_name,
        employee_name,
        created_by: seed.created_by.clone(),
        scoring_method: seed.scoring_method.clone(),
        target: seed.target.clone(),
        overall_score: None,
        created_at: Utc::now(),
    }
}

/// Manager fan-out: one goal per employee of the manager's department.
/// `manager_name` stays null on every row; the manager is recorded as
/// creator only.
fn expand_for_employees(seed: &GoalSeed, employees: &[String]) -> Vec<GoalRecord> {
    employees
        .iter()
        .map(|employee| build_goal(seed, None, Some(employee.clone())))
        .collect()
}

/// Admin fan-out: one goal per manager of the department, all sharing the
/// optionally supplied employee assignment.
fn expand_for_managers(
    seed: &GoalSeed,
    managers: &[String],
    employee_name: Option<&str>,
) -> Vec<GoalRecord> {
    managers
        .iter()
        .map(|manager| {
            build_goal(
                seed,
                Some(manager.clone()),
                employee_name.map(|e| e.to_string()),
            )
        })
        .collect()
}

/// Human-readable creation notice for the assignee, when there is one.
fn creation_notice(record: &GoalRecord, creator_role: Role, creator: &str) -> Option<Notification> {
    if let Some(employee) = &record.employee_name {
        return Some(Notification::to_name(
            employee.clone(),
            "New KRA assigned",
            format!(
                "{} {} assigned you the KRA \"{}\" in {}.",
                creator_role.display(),
                creator,
                record.name,
                record.department
            ),
        ));
    }
    if let Some(manager) = &record.manager_name {
        return Some(Notification::to_name(
            manager.clone(),
            "New KRA for your team",
            format!(
                "{} {} created the KRA \"{}\" in {} under your management.",
                creator_role.display(),
                creator,
                record.name,
                record.department
            ),
        ));
    }
    None
}

/// A manager may act on a goal in their own department or on one that
/// names them as manager.
pub fn manager_owns_goal(profile: &UserProfile, goal: &GoalRecord) -> bool {
    profile.department.as_deref() == Some(goal.department.as_str())
        || goal.manager_name.as_deref() == Some(profile.name.as_str())
}

/// An employee may act only on goals assigned to them by exact name.
pub fn employee_owns_goal(profile: &UserProfile, goal: &GoalRecord) -> bool {
    goal.employee_name.as_deref() == Some(profile.name.as_str())
}

pub async fn resolve_profile(state: &AppState, user: &AuthUser) -> Result<UserProfile, ApiError> {
    state
        .directory
        .profile_by_email(&user.email)
        .await?
        .ok_or_else(|| {
            ApiError::Validation(format!("no directory profile for {}", user.email))
        })
}

pub async fn create_goal(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateGoalRequest>,
) -> Result<Json<ApiResponse<GoalCreation>>, ApiError> {
    require_role(&user, &[Role::Admin, Role::Manager])?;

    let name = required_field(&req.name, "name")?;
    let definition = required_field(&req.definition, "definition")?;
    let scoring_method = required_field(&req.scoring_method, "scoring_method")?;
    let target = req
        .target
        .map(|v| audit::decimal_from_f64("target", v))
        .transpose()?;

    let profile = resolve_profile(&state, &user).await?;

    let (records, fanned_out) = if user.role == Role::Manager {
        let department = profile.department.clone().ok_or_else(|| {
            ApiError::Validation("manager has no department on file".to_string())
        })?;
        let seed = GoalSeed {
            name,
            definition,
            scoring_method,
            target,
            department: department.clone(),
            created_by: profile.name.clone(),
        };
        if is_all(req.employee_name.as_deref()) {
            let employees = state
                .directory
                .members(Role::Employee, Some(&department))
                .await?;
            if employees.is_empty() {
                return Err(ApiError::Validation(format!(
                    "department {} has no employees to assign",
                    department
                )));
            }
            let names: Vec<String> = employees.into_iter().map(|p| p.name).collect();
            (expand_for_employees(&seed, &names), true)
        } else {
            (
                vec![build_goal(&seed, None, req.employee_name.clone())],
                false,
            )
        }
    } else {
        let department = required_field(&req.dept, "dept")?;
        let manager_name = required_field(&req.manager_name, "manager_name")?;
        let seed = GoalSeed {
            name,
            definition,
            scoring_method,
            target,
            department: department.clone(),
            created_by: profile.name.clone(),
        };
        if manager_name.eq_ignore_ascii_case(ALL_SENTINEL) {
            let managers = state
                .directory
                .members(Role::Manager, Some(&department))
                .await?;
            if managers.is_empty() {
                return Err(ApiError::Validation(format!(
                    "department {} has no managers to assign",
                    department
                )));
            }
            let names: Vec<String> = managers.into_iter().map(|p| p.name).collect();
            (
                expand_for_managers(&seed, &names, req.employee_name.as_deref()),
                true,
            )
        } else {
            (
                vec![build_goal(
                    &seed,
                    Some(manager_name),
                    req.employee_name.clone(),
                )],
                false,
            )
        }
    };

    let pool = state.conn.clone();
    let actor = profile.name.clone();
    let to_insert = records;
    let saved = tokio::task::spawn_blocking(move || -> Result<Vec<GoalRecord>, ApiError> {
        let mut conn = pool.get()?;
        conn.transaction::<_, ApiError, _>(|conn| {
            for record in &to_insert {
                audit::record_goal_creation(conn, record, &actor)?;
            }
            Ok(to_insert)
        })
    })
    .await??;

    info!(
        "created {} KRA(s) in {} by {}",
        saved.len(),
        saved[0].department,
        profile.name
    );

    for record in &saved {
        if let Some(note) = creation_notice(record, user.role, &profile.name) {
            let email = match &note.recipient_name {
                Some(name) => state.directory.email_by_name(name).await.ok().flatten(),
                None => None,
            };
            notify_best_effort(state.notifier.as_ref(), note.with_email(email)).await;
        }
    }

    let mut created: Vec<Goal> = saved.into_iter().map(record_to_goal).collect();
    let data = if fanned_out {
        GoalCreation::Many(created)
    } else {
        GoalCreation::Single(created.remove(0))
    };
    Ok(Json(ApiResponse::ok(data)))
}

pub async fn list_goals(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<ApiResponse<Vec<Goal>>>, ApiError> {
    require_role(&user, &[Role::Admin, Role::Manager])?;

    let pool = state.conn.clone();
    let records = tokio::task::spawn_blocking(move || -> Result<Vec<GoalRecord>, ApiError> {
        let mut conn = pool.get()?;
        let records = goals::table
            .order(goals::created_at.desc())
            .select(GoalRecord::as_select())
            .load::<GoalRecord>(&mut conn)?;
        Ok(records)
    })
    .await??;

    Ok(Json(ApiResponse::ok(
        records.into_iter().map(record_to_goal).collect(),
    )))
}

pub async fn get_goal(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Goal>>, ApiError> {
    require_role(&user, &[Role::Admin, Role::Manager])?;

    let pool = state.conn.clone();
    let record = tokio::task::spawn_blocking(move || -> Result<Option<GoalRecord>, ApiError> {
        let mut conn = pool.get()?;
        let record = goals::table
            .find(id)
            .select(GoalRecord::as_select())
            .first::<GoalRecord>(&mut conn)
            .optional()?;
        Ok(record)
    })
    .await??
    .ok_or_else(|| ApiError::NotFound(format!("KRA {} not found", id)))?;

    if user.role == Role::Manager {
        let profile = resolve_profile(&state, &user).await?;
        if profile.department.as_deref() != Some(record.department.as_str()) {
            return Err(ApiError::Forbidden(
                "KRA belongs to another department".to_string(),
            ));
        }
    }

    Ok(Json(ApiResponse::ok(record_to_goal(record))))
}

pub async fn list_goals_by_department(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(dept): Path<String>,
) -> Result<Json<ApiResponse<Vec<Goal>>>, ApiError> {
    require_role(&user, &[Role::Admin, Role::Manager])?;

    let pool = state.conn.clone();
    let records = tokio::task::spawn_blocking(move || -> Result<Vec<GoalRecord>, ApiError> {
        let mut conn = pool.get()?;
        let records = goals::table
            .filter(goals::department.eq(&dept))
            .order(goals::created_at.desc())
            .select(GoalRecord::as_select())
            .load::<GoalRecord>(&mut conn)?;
        Ok(records)
    })
    .await??;

    Ok(Json(ApiResponse::ok(
        records.into_iter().map(record_to_goal).collect(),
    )))
}

pub async fn list_goal_logs(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<GoalLogQuery>,
) -> Result<Json<ApiResponse<Vec<GoalLogView>>>, ApiError> {
    require_role(&user, &[Role::Admin, Role::Manager])?;

    // Managers only ever see their own department; a manager with no
    // department on file sees nothing (fail closed).
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
        move || -> Result<Vec<audit::GoalLogRecord>, ApiError> {
            let mut conn = pool.get()?;
            let mut q = goal_logs::table.into_boxed();
            if let Some(dept) = forced_dept {
                q = q.filter(goal_logs::department.eq(dept));
            }
            if let Some(manager) = query.manager {
                q = q.filter(goal_logs::manager_name.eq(manager));
            }
            if let Some(employee) = query.employee {
                q = q.filter(goal_logs::employee_name.eq(employee));
            }
            if let Some(kra_id) = query.kra_id {
                q = q.filter(goal_logs::goal_id.eq(kra_id));
            }
            let logs = q
                .order(goal_logs::updated_at.desc())
                .select(audit::GoalLogRecord::as_select())
                .load::<audit::GoalLogRecord>(&mut conn)?;
            Ok(logs)
        },
    )
    .await??;

    Ok(Json(ApiResponse::ok(
        logs.into_iter().map(log_to_view).collect(),
    )))
}

fn update_to_changes(req: &UpdateGoalRequest) -> ChangeMap {
    let mut changes = ChangeMap::new();
    if let Some(v) = &req.name {
        changes.insert("name".to_string(), json!(v));
    }
    if let Some(v) = &req.definition {
        changes.insert("definition".to_string(), json!(v));
    }
    if let Some(v) = req.target {
        changes.insert("target".to_string(), json!(v));
    }
    if let Some(v) = &req.manager_name {
        changes.insert("manager_name".to_string(), json!(v));
    }
    if let Some(v) = &req.employee_name {
        changes.insert("employee_name".to_string(), json!(v));
    }
    changes
}

pub async fn update_goal(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateGoalRequest>,
) -> Result<Json<ApiResponse<Goal>>, ApiError> {
    require_role(&user, &[Role::Admin])?;
    let profile = resolve_profile(&state, &user).await?;

    let changes = update_to_changes(&req);
    let pool = state.conn.clone();
    let actor = profile.name.clone();
    let record = tokio::task::spawn_blocking(move || -> Result<GoalRecord, ApiError> {
        let mut conn = pool.get()?;
        audit::record_goal_change(&mut conn, id, &changes, &actor)
    })
    .await??;

    info!("KRA {} updated by {}", id, profile.name);
    Ok(Json(ApiResponse::ok(record_to_goal(record))))
}

pub async fn assign_goal(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<AssignGoalRequest>,
) -> Result<Json<ApiResponse<Goal>>, ApiError> {
    require_role(&user, &[Role::Admin])?;
    let profile = resolve_profile(&state, &user).await?;

    let mut changes = ChangeMap::new();
    if let Some(v) = &req.manager_name {
        changes.insert("manager_name".to_string(), json!(v));
    }
    if let Some(v) = &req.employee_name {
        changes.insert("employee_name".to_string(), json!(v));
    }

    let pool = state.conn.clone();
    let actor = profile.name.clone();
    let record = tokio::task::spawn_blocking(move || -> Result<GoalRecord, ApiError> {
        let mut conn = pool.get()?;
        audit::record_goal_change(&mut conn, id, &changes, &actor)
    })
    .await??;

    info!("KRA {} reassigned by {}", id, profile.name);
    Ok(Json(ApiResponse::ok(record_to_goal(record))))
}

pub async fn delete_goal(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    require_role(&user, &[Role::Admin])?;

    let pool = state.conn.clone();
    let deleted = tokio::task::spawn_blocking(move || -> Result<usize, ApiError> {
        let mut conn = pool.get()?;
        let deleted = diesel::delete(goals::table.find(id)).execute(&mut conn)?;
        Ok(deleted)
    })
    .await??;

    if deleted == 0 {
        return Err(ApiError::NotFound(format!("KRA {} not found", id)));
    }
    info!("KRA {} deleted by {}", id, user.name);
    Ok(Json(ApiResponse::message("KRA deleted")))
}

pub fn configure_goal_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/kra/create", post(create_goal))
        .route("/kra", get(list_goals))
        .route("/kra/logs", get(list_goal_logs))
        .route("/kra/department/:dept", get(list_goals_by_department))
        .route(
            "/kra/:id",
            get(get_goal).delete(delete_goal),
        )
        .route("/kra/:id/update", post(update_goal))
        .route("/kra/:id/assign", post(assign_goal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn seed() -> GoalSeed {
        GoalSeed {
            name: "Q1 Sales".to_string(),
            definition: "Hit the Q1 number".to_string(),
            scoring_method: "percentage".to_string(),
            target: Some(BigDecimal::from_str("80").unwrap()),
            department: "Sales".to_string(),
            created_by: "Asha Rao".to_string(),
        }
    }

    #[test]
    fn all_sentinel_is_case_insensitive() {
        assert!(is_all(Some("all")));
        assert!(is_all(Some("All")));
        assert!(is_all(Some(" ALL ")));
        assert!(!is_all(Some("Allan")));
        assert!(!is_all(None));
    }

    #[test]
    fn manager_fanout_assigns_each_employee_and_no_manager() {
        let employees = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let records = expand_for_employees(&seed(), &employees);

        assert_eq!(records.len(), 3);
        let assigned: Vec<_> = records
            .iter()
            .map(|r| r.employee_name.clone().unwrap())
            .collect();
        assert_eq!(assigned, employees);
        assert!(records.iter().all(|r| r.manager_name.is_none()));
        assert!(records.iter().all(|r| r.department == "Sales"));
        let ids: std::collections::HashSet<_> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn admin_fanout_shares_employee_across_managers() {
        let managers = vec!["M1".to_string(), "M2".to_string()];
        let records = expand_for_managers(&seed(), &managers, Some("Ben Ortiz"));

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].manager_name.as_deref(), Some("M1"));
        assert_eq!(records[1].manager_name.as_deref(), Some("M2"));
        assert!(records
            .iter()
            .all(|r| r.employee_name.as_deref() == Some("Ben Ortiz")));
    }

    #[test]
    fn creation_notice_targets_assignee_first() {
        let mut record = build_goal(&seed(), Some("M1".to_string()), Some("E1".to_string()));
        let note = creation_notice(&record, Role::Admin, "Root").unwrap();
        assert_eq!(note.recipient_name.as_deref(), Some("E1"));
        assert!(note.body.contains("Admin Root"));
        assert!(note.body.contains("Q1 Sales"));

        record.employee_name = None;
        let note = creation_notice(&record, Role::Admin, "Root").unwrap();
        assert_eq!(note.recipient_name.as_deref(), Some("M1"));

        record.manager_name = None;
        assert!(creation_notice(&record, Role::Admin, "Root").is_none());
    }

    #[test]
    fn update_request_maps_only_present_fields() {
        let req = UpdateGoalRequest {
            name: Some("Renamed".to_string()),
            definition: None,
            target: Some(90.0),
            manager_name: None,
            employee_name: None,
        };
        let changes = update_to_changes(&req);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes["name"], json!("Renamed"));
        assert_eq!(changes["target"], json!(90.0));
        assert!(!changes.contains_key("definition"));
    }

    #[test]
    fn required_field_trims_and_rejects_blank() {
        assert_eq!(
            required_field(&Some("  x  ".to_string()), "name").unwrap(),
            "x"
        );
        assert!(required_field(&Some("   ".to_string()), "name").is_err());
        assert!(required_field(&None, "name").is_err());
    }

    #[test]
    fn ownership_checks_match_department_or_name() {
        let goal = build_goal(&seed(), Some("Asha Rao".to_string()), Some("Ben".to_string()));
        let manager = UserProfile {
            id: Uuid::new_v4(),
            name: "Asha Rao".to_string(),
            email: "asha@example.com".to_string(),
            role: Role::Manager,
            department: Some("Support".to_string()),
        };
        // named as manager, even though the department differs
        assert!(manager_owns_goal(&manager, &goal));

        let other = UserProfile {
            department: Some("Sales".to_string()),
            name: "Someone Else".to_string(),
            ..manager.clone()
        };
        // same department, not named
        assert!(manager_owns_goal(&other, &goal));

        let outsider = UserProfile {
            department: None,
            name: "Stranger".to_string(),
            ..manager.clone()
        };
        assert!(!manager_owns_goal(&outsider, &goal));

        let employee = UserProfile {
            name: "Ben".to_string(),
            role: Role::Employee,
            ..manager.clone()
        };
        assert!(employee_owns_goal(&employee, &goal));
        let wrong = UserProfile {
            name: "ben".to_string(),
            ..employee.clone()
        };
        // exact-match policy: names are case-sensitive
        assert!(!employee_owns_goal(&wrong, &goal));
    }
}
