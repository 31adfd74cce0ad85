use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use lettre::{transport::smtp::authentication::Credentials, Message, SmtpTransport, Transport};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::{AuthUser, Role};
use crate::config::SmtpConfig;
use crate::schema::notifications;
use crate::shared::error::ApiError;
use crate::shared::response::ApiResponse;
use crate::shared::state::AppState;
use crate::shared::utils::DbPool;

/// One outgoing notification. Either `recipient_name` is set (direct) or
/// only `recipient_role` is (broadcast to every holder of the role).
/// `email_to` is filled in by the caller when the recipient's address could
/// be resolved through the directory; without it only the in-app row and
/// the optional chat webhook fire.
#[derive(Debug, Clone)]
pub struct Notification {
    pub recipient_name: Option<String>,
    pub recipient_role: Option<Role>,
    pub subject: String,
    pub body: String,
    pub email_to: Option<String>,
}

impl Notification {
    pub fn to_name(name: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient_name: Some(name.into()),
            recipient_role: None,
            subject: subject.into(),
            body: body.into(),
            email_to: None,
        }
    }

    pub fn broadcast(role: Role, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient_name: None,
            recipient_role: Some(role),
            subject: subject.into(),
            body: body.into(),
            email_to: None,
        }
    }

    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email_to = email;
        self
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, note: Notification) -> Result<(), ApiError>;
}

/// Workflow outcomes never fail because a notification could not be
/// delivered; failures are logged and swallowed here.
pub async fn notify_best_effort(notifier: &dyn Notifier, note: Notification) {
    let subject = note.subject.clone();
    if let Err(err) = notifier.send(note).await {
        warn!("notification {:?} not delivered: {}", subject, err);
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = notifications)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub recipient_name: Option<String>,
    pub recipient_role: Option<String>,
    pub subject: String,
    pub body: String,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Production notifier: persists an in-app row, then fans out to SMTP and
/// the chat webhook when those are configured.
pub struct PgNotifier {
    pool: DbPool,
    smtp: Option<SmtpConfig>,
    slack_webhook: Option<String>,
    http: reqwest::Client,
}

impl PgNotifier {
    pub fn new(pool: DbPool, smtp: Option<SmtpConfig>, slack_webhook: Option<String>) -> Self {
        Self {
            pool,
            smtp,
            slack_webhook,
            http: reqwest::Client::new(),
        }
    }

    async fn post_webhook(&self, url: &str, note: &Notification) -> Result<(), ApiError> {
        let text = format!("*{}*\n{}", note.subject, note.body);
        let response = self
            .http
            .post(url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| ApiError::Internal(format!("webhook request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(ApiError::Internal(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn send_email(smtp: &SmtpConfig, to: &str, subject: &str, body: &str) -> Result<(), ApiError> {
    let email = Message::builder()
        .from(
            smtp.from
                .parse()
                .map_err(|e| ApiError::Internal(format!("invalid from address: {}", e)))?,
        )
        .to(to
            .parse()
            .map_err(|e| ApiError::Internal(format!("invalid to address: {}", e)))?)
        .subject(subject)
        .header(lettre::message::header::ContentType::TEXT_HTML)
        .body(body.to_string())
        .map_err(|e| ApiError::Internal(format!("failed to build email: {}", e)))?;

    let creds = Credentials::new(smtp.username.clone(), smtp.password.clone());
    let mailer = SmtpTransport::relay(&smtp.server)
        .map_err(|e| ApiError::Internal(format!("failed to create SMTP transport: {}", e)))?
        .port(smtp.port)
        .credentials(creds)
        .build();

    mailer
        .send(&email)
        .map_err(|e| ApiError::Internal(format!("failed to send email: {}", e)))?;
    Ok(())
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn send(&self, note: Notification) -> Result<(), ApiError> {
        let record = NotificationRecord {
            id: Uuid::new_v4(),
            recipient_name: note.recipient_name.clone(),
            recipient_role: note.recipient_role.map(|r| r.as_str().to_string()),
            subject: note.subject.clone(),
            body: note.body.clone(),
            read_at: None,
            created_at: Utc::now(),
        };

        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<(), ApiError> {
            let mut conn = pool.get()?;
            diesel::insert_into(notifications::table)
                .values(&record)
                .execute(&mut conn)?;
            Ok(())
        })
        .await??;

        match (&self.smtp, &note.email_to) {
            (Some(smtp), Some(to)) => {
                let smtp = smtp.clone();
                let to = to.clone();
                let subject = note.subject.clone();
                let body = note.body.clone();
                tokio::task::spawn_blocking(move || send_email(&smtp, &to, &subject, &body))
                    .await??;
            }
            _ => debug!("no email for notification {:?}", note.subject),
        }

        if let Some(url) = &self.slack_webhook {
            self.post_webhook(url, &note).await?;
        }

        Ok(())
    }
}

/// Test notifier that records everything it is asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: std::sync::Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, note: Notification) -> Result<(), ApiError> {
        self.sent.lock().unwrap().push(note);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub read: Option<bool>,
}

/// Feed for the signed-in account: rows addressed to it by name plus
/// broadcasts to its role.
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<ApiResponse<Vec<NotificationRecord>>>, ApiError> {
    let pool = state.conn.clone();
    let name = user.name.clone();
    let role = user.role.as_str().to_string();
    let records = tokio::task::spawn_blocking(move || -> Result<Vec<NotificationRecord>, ApiError> {
        let mut conn = pool.get()?;
        let records = notifications::table
            .filter(
                notifications::recipient_name
                    .eq(&name)
                    .or(notifications::recipient_name
                        .is_null()
                        .and(notifications::recipient_role.eq(&role))),
            )
            .order(notifications::created_at.desc())
            .select(NotificationRecord::as_select())
            .load::<NotificationRecord>(&mut conn)?;
        Ok(records)
    })
    .await??;
    Ok(Json(ApiResponse::ok(records)))
}

pub async fn mark_notification_read(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<NotificationRecord>>, ApiError> {
    let pool = state.conn.clone();
    let name = user.name.clone();
    let role = user.role.as_str().to_string();
    let record = tokio::task::spawn_blocking(move || -> Result<NotificationRecord, ApiError> {
        let mut conn = pool.get()?;
        let record = notifications::table
            .find(id)
            .select(NotificationRecord::as_select())
            .first::<NotificationRecord>(&mut conn)
            .optional()?
            .ok_or_else(|| ApiError::NotFound(format!("notification {} not found", id)))?;

        let addressed_to_me = record.recipient_name.as_deref() == Some(name.as_str())
            || (record.recipient_name.is_none()
                && record.recipient_role.as_deref() == Some(role.as_str()));
        if !addressed_to_me {
            return Err(ApiError::Forbidden(
                "notification belongs to another account".to_string(),
            ));
        }

        let updated = diesel::update(notifications::table.find(id))
            .set(notifications::read_at.eq(Some(Utc::now())))
            .returning(NotificationRecord::as_returning())
            .get_result::<NotificationRecord>(&mut conn)?;
        Ok(updated)
    })
    .await??;
    Ok(Json(ApiResponse::ok(record)))
}

pub fn configure_notify_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/notifications", get(list_notifications))
        .route("/notifications/:id/read", put(mark_notification_read))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn best_effort_swallows_failures() {
        struct FailingNotifier;

        #[async_trait]
        impl Notifier for FailingNotifier {
            async fn send(&self, _note: Notification) -> Result<(), ApiError> {
                Err(ApiError::Internal("smtp down".to_string()))
            }
        }

        notify_best_effort(
            &FailingNotifier,
            Notification::to_name("Asha Rao", "subject", "body"),
        )
        .await;
    }

    #[tokio::test]
    async fn recording_notifier_keeps_order() {
        let notifier = RecordingNotifier::new();
        notifier
            .send(Notification::to_name("A", "first", "x"))
            .await
            .unwrap();
        notifier
            .send(Notification::broadcast(Role::Admin, "second", "y"))
            .await
            .unwrap();
        let sent = notifier.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].subject, "first");
        assert_eq!(sent[1].recipient_role, Some(Role::Admin));
        assert!(sent[1].recipient_name.is_none());
    }
}
