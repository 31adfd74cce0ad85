use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{require_role, AuthUser, Role};
use crate::schema::departments;
use crate::shared::error::ApiError;
use crate::shared::response::ApiResponse;
use crate::shared::state::AppState;

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = departments)]
pub struct DepartmentRecord {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateDepartmentRequest {
    pub name: Option<String>,
}

pub async fn create_department(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateDepartmentRequest>,
) -> Result<Json<ApiResponse<DepartmentRecord>>, ApiError> {
    require_role(&user, &[Role::Admin])?;
    let name = req
        .name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::Validation("name is required".to_string()))?
        .to_string();

    let pool = state.conn.clone();
    let record = tokio::task::spawn_blocking(move || -> Result<DepartmentRecord, ApiError> {
        let mut conn = pool.get()?;
        let record = DepartmentRecord {
            id: Uuid::new_v4(),
            name,
            created_at: Utc::now(),
        };
        // duplicate names surface as Conflict through the unique index
        diesel::insert_into(departments::table)
            .values(&record)
            .execute(&mut conn)?;
        Ok(record)
    })
    .await??;

    info!("department {} created by {}", record.name, user.name);
    Ok(Json(ApiResponse::ok(record)))
}

pub async fn list_departments(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<ApiResponse<Vec<DepartmentRecord>>>, ApiError> {
    require_role(&user, &[Role::Admin, Role::Manager, Role::Employee])?;
    let pool = state.conn.clone();
    let records = tokio::task::spawn_blocking(move || -> Result<Vec<DepartmentRecord>, ApiError> {
        let mut conn = pool.get()?;
        let records = departments::table
            .order(departments::name.asc())
            .select(DepartmentRecord::as_select())
            .load::<DepartmentRecord>(&mut conn)?;
        Ok(records)
    })
    .await??;
    Ok(Json(ApiResponse::ok(records)))
}

/// Departments are referenced from KRAs and users by name, not key, so
/// removing one leaves existing rows untouched.
pub async fn delete_department(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    require_role(&user, &[Role::Admin])?;
    let pool = state.conn.clone();
    tokio::task::spawn_blocking(move || -> Result<(), ApiError> {
        let mut conn = pool.get()?;
        let deleted = diesel::delete(departments::table.find(id)).execute(&mut conn)?;
        if deleted == 0 {
            return Err(ApiError::NotFound(format!("department {} not found", id)));
        }
        Ok(())
    })
    .await??;

    info!("department {} deleted by {}", id, user.name);
    Ok(Json(ApiResponse::message("department deleted")))
}

pub fn configure_department_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/departments", get(list_departments).post(create_department))
        .route("/departments/:id", delete(delete_department))
}
