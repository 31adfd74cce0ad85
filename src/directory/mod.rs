use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{require_role, AuthUser, Role};
use crate::schema::users;
use crate::shared::error::ApiError;
use crate::shared::response::ApiResponse;
use crate::shared::state::AppState;
use crate::shared::utils::DbPool;

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = users)]
pub struct UserRecord {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: String,
    pub department: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Canonical identity of an account: the `name` here is the value goal
/// assignments and request approver fields store.
#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub department: Option<String>,
}

fn record_to_profile(record: UserRecord) -> Result<UserProfile, ApiError> {
    let role = Role::parse(&record.role).ok_or_else(|| {
        ApiError::Internal(format!(
            "user {} has unknown role {:?}",
            record.email, record.role
        ))
    })?;
    Ok(UserProfile {
        id: record.id,
        name: record.name,
        email: record.email,
        role,
        department: record.department,
    })
}

/// Lookup seam between the workflow modules and the account store. The
/// production impl reads the `users` table; tests swap in a fixed roster.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    async fn profile_by_email(&self, email: &str) -> Result<Option<UserProfile>, ApiError>;

    async fn email_by_name(&self, name: &str) -> Result<Option<String>, ApiError>;

    /// All accounts holding `role`, optionally narrowed to one department.
    async fn members(
        &self,
        role: Role,
        department: Option<&str>,
    ) -> Result<Vec<UserProfile>, ApiError>;
}

pub struct PgDirectory {
    pool: DbPool,
}

impl PgDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DirectoryService for PgDirectory {
    async fn profile_by_email(&self, email: &str) -> Result<Option<UserProfile>, ApiError> {
        let pool = self.pool.clone();
        let email = email.to_string();
        let record = tokio::task::spawn_blocking(move || -> Result<Option<UserRecord>, ApiError> {
            let mut conn = pool.get()?;
            let record = users::table
                .filter(users::email.eq(&email))
                .select(UserRecord::as_select())
                .first::<UserRecord>(&mut conn)
                .optional()?;
            Ok(record)
        })
        .await??;
        record.map(record_to_profile).transpose()
    }

    async fn email_by_name(&self, name: &str) -> Result<Option<String>, ApiError> {
        let pool = self.pool.clone();
        let name = name.to_string();
        let email = tokio::task::spawn_blocking(move || -> Result<Option<String>, ApiError> {
            let mut conn = pool.get()?;
            let email = users::table
                .filter(users::name.eq(&name))
                .select(users::email)
                .first::<String>(&mut conn)
                .optional()?;
            Ok(email)
        })
        .await??;
        Ok(email)
    }

    async fn members(
        &self,
        role: Role,
        department: Option<&str>,
    ) -> Result<Vec<UserProfile>, ApiError> {
        let pool = self.pool.clone();
        let department = department.map(|d| d.to_string());
        let records = tokio::task::spawn_blocking(move || -> Result<Vec<UserRecord>, ApiError> {
            let mut conn = pool.get()?;
            let mut query = users::table
                .filter(users::role.eq(role.as_str()))
                .into_boxed();
            if let Some(dept) = department {
                query = query.filter(users::department.eq(dept));
            }
            let records = query
                .order(users::name.asc())
                .select(UserRecord::as_select())
                .load::<UserRecord>(&mut conn)?;
            Ok(records)
        })
        .await??;
        records.into_iter().map(record_to_profile).collect()
    }
}

/// Fixed in-memory roster, used by unit tests and local experiments.
#[derive(Default)]
pub struct StaticDirectory {
    profiles: Vec<UserProfile>,
}

impl StaticDirectory {
    pub fn new(profiles: Vec<UserProfile>) -> Self {
        Self { profiles }
    }
}

#[async_trait]
impl DirectoryService for StaticDirectory {
    async fn profile_by_email(&self, email: &str) -> Result<Option<UserProfile>, ApiError> {
        Ok(self.profiles.iter().find(|p| p.email == email).cloned())
    }

    async fn email_by_name(&self, name: &str) -> Result<Option<String>, ApiError> {
        Ok(self
            .profiles
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.email.clone()))
    }

    async fn members(
        &self,
        role: Role,
        department: Option<&str>,
    ) -> Result<Vec<UserProfile>, ApiError> {
        Ok(self
            .profiles
            .iter()
            .filter(|p| p.role == role)
            .filter(|p| match department {
                Some(dept) => p.department.as_deref() == Some(dept),
                None => true,
            })
            .cloned()
            .collect())
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
    pub role: String,
    pub department: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub role: Option<String>,
    pub dept: Option<String>,
}

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<ApiResponse<UserProfile>>, ApiError> {
    require_role(&user, &[Role::Admin])?;
    let role = Role::parse(&req.role)
        .ok_or_else(|| ApiError::Validation(format!("unknown role: {}", req.role)))?;
    if req.name.trim().is_empty() || req.email.trim().is_empty() {
        return Err(ApiError::Validation(
            "name and email are required".to_string(),
        ));
    }

    let record = UserRecord {
        id: Uuid::new_v4(),
        name: req.name.trim().to_string(),
        email: req.email.trim().to_string(),
        role: role.as_str().to_string(),
        department: req.department.clone(),
        created_at: Utc::now(),
    };

    let pool = state.conn.clone();
    let inserted = tokio::task::spawn_blocking(move || -> Result<UserRecord, ApiError> {
        let mut conn = pool.get()?;
        diesel::insert_into(users::table)
            .values(&record)
            .execute(&mut conn)?;
        Ok(record)
    })
    .await??;

    info!("created account {} ({})", inserted.name, inserted.role);
    Ok(Json(ApiResponse::ok(record_to_profile(inserted)?)))
}

pub async fn list_users(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(params): Query<UserQuery>,
) -> Result<Json<ApiResponse<Vec<UserProfile>>>, ApiError> {
    require_role(&user, &[Role::Admin, Role::Manager])?;

    let pool = state.conn.clone();
    let records = tokio::task::spawn_blocking(move || -> Result<Vec<UserRecord>, ApiError> {
        let mut conn = pool.get()?;
        let mut query = users::table.into_boxed();
        if let Some(role) = params.role {
            let role = Role::parse(&role)
                .ok_or_else(|| ApiError::Validation(format!("unknown role: {}", role)))?;
            query = query.filter(users::role.eq(role.as_str()));
        }
        if let Some(dept) = params.dept {
            query = query.filter(users::department.eq(dept));
        }
        let records = query
            .order(users::name.asc())
            .select(UserRecord::as_select())
            .load::<UserRecord>(&mut conn)?;
        Ok(records)
    })
    .await??;

    let profiles = records
        .into_iter()
        .map(record_to_profile)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(ApiResponse::ok(profiles)))
}

pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    require_role(&user, &[Role::Admin])?;

    let pool = state.conn.clone();
    let deleted = tokio::task::spawn_blocking(move || -> Result<usize, ApiError> {
        let mut conn = pool.get()?;
        let deleted = diesel::delete(users::table.find(user_id)).execute(&mut conn)?;
        Ok(deleted)
    })
    .await??;

    if deleted == 0 {
        return Err(ApiError::NotFound(format!("user {} not found", user_id)));
    }
    info!("deleted account {}", user_id);
    Ok(Json(ApiResponse::message("User deleted")))
}

pub fn configure_directory_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/users/:id", axum::routing::delete(delete_user))
}
