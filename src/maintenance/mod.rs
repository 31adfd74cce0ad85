//! Scheduled upkeep: KPI expiry, KRA score aggregation, due-date reminders,
//! and the weekly department report.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use bigdecimal::ToPrimitive;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use cron::Schedule;
use diesel::prelude::*;
use log::{error, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::audit::{self, ChangeMap};
use crate::auth::{require_role, AuthUser, Role};
use crate::config::MaintenanceConfig;
use crate::directory::DirectoryService;
use crate::goals::GoalRecord;
use crate::metrics::{MetricRecord, MetricStatus};
use crate::notify::{notify_best_effort, Notification, Notifier};
use crate::schema::{goals, metrics};
use crate::shared::error::ApiError;
use crate::shared::response::ApiResponse;
use crate::shared::state::AppState;
use crate::shared::utils::{today_local, DbPool};

/// Attribution written into audit logs for batch mutations.
pub const SYSTEM_ACTOR: &str = "system";

/// Turns a weekly department summary into its distributable form. The
/// default keeps the HTML as-is; a PDF-producing impl slots in without
/// touching the job.
pub trait ReportRenderer: Send + Sync {
    fn render(&self, html: &str) -> Result<Vec<u8>, ApiError>;
}

pub struct HtmlPassthrough;

impl ReportRenderer for HtmlPassthrough {
    fn render(&self, html: &str) -> Result<Vec<u8>, ApiError> {
        Ok(html.as_bytes().to_vec())
    }
}

/// Mean of the present scores; `None` when there is nothing to average.
pub fn aggregate_score(scores: &[f64]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    Some(scores.iter().sum::<f64>() / scores.len() as f64)
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DailySummary {
    pub expired: usize,
    pub rescored: usize,
    pub reminders: usize,
}

pub struct MaintenanceJob {
    pool: DbPool,
    directory: Arc<dyn DirectoryService>,
    notifier: Arc<dyn Notifier>,
    renderer: Arc<dyn ReportRenderer>,
    config: MaintenanceConfig,
}

impl MaintenanceJob {
    pub fn new(
        pool: DbPool,
        directory: Arc<dyn DirectoryService>,
        notifier: Arc<dyn Notifier>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            pool,
            directory,
            notifier,
            renderer: Arc::new(HtmlPassthrough),
            config,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ReportRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn from_state(state: &AppState) -> Self {
        Self::new(
            state.conn.clone(),
            Arc::clone(&state.directory),
            Arc::clone(&state.notifier),
            state.config.maintenance.clone(),
        )
    }

    /// Minute tick loop over both cron schedules. Each run failure is
    /// logged; the loop itself never exits.
    pub fn start(self: Arc<Self>) {
        info!(
            "maintenance scheduler started (daily {:?}, weekly {:?})",
            self.config.daily_cron, self.config.weekly_cron
        );
        tokio::spawn(async move {
            let daily = match Schedule::from_str(&self.config.daily_cron) {
                Ok(schedule) => schedule,
                Err(err) => {
                    error!("daily cron {:?} invalid: {}", self.config.daily_cron, err);
                    return;
                }
            };
            let weekly = match Schedule::from_str(&self.config.weekly_cron) {
                Ok(schedule) => schedule,
                Err(err) => {
                    error!("weekly cron {:?} invalid: {}", self.config.weekly_cron, err);
                    return;
                }
            };

            let mut next_daily = upcoming(&daily);
            let mut next_weekly = upcoming(&weekly);
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let now = Utc::now();
                if next_daily.map_or(false, |at| at <= now) {
                    self.run_daily().await;
                    next_daily = upcoming(&daily);
                }
                if next_weekly.map_or(false, |at| at <= now) {
                    self.run_weekly_report().await;
                    next_weekly = upcoming(&weekly);
                }
            }
        });
    }

    pub async fn run_daily(&self) -> DailySummary {
        let today = today_local();
        let summary = DailySummary {
            expired: self.expire_overdue_metrics(today).await,
            rescored: self.recompute_overall_scores().await,
            reminders: self.send_due_reminders(today).await,
        };
        info!(
            "daily maintenance done: {} KPIs expired, {} KRAs rescored, {} reminders sent",
            summary.expired, summary.rescored, summary.reminders
        );
        summary
    }

    /// Flips Active KPIs whose due date has passed to End, one logged
    /// mutation per KPI. The save itself re-derives the status; the batch
    /// only selects the rows that need it.
    async fn expire_overdue_metrics(&self, today: NaiveDate) -> usize {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<usize, ApiError> {
            let mut conn = pool.get()?;
            let overdue = metrics::table
                .filter(metrics::status.eq(MetricStatus::Active.as_str()))
                .filter(metrics::due_date.lt(today))
                .select(metrics::id)
                .load::<Uuid>(&mut conn)?;

            let mut expired = 0;
            for kpi_id in overdue {
                match audit::record_metric_change(&mut conn, kpi_id, &ChangeMap::new(), SYSTEM_ACTOR)
                {
                    Ok(_) => expired += 1,
                    Err(err) => error!("expiry of KPI {} failed: {}", kpi_id, err),
                }
            }
            Ok(expired)
        })
        .await;

        match result {
            Ok(Ok(count)) => count,
            Ok(Err(err)) => {
                error!("KPI expiry pass failed: {}", err);
                0
            }
            Err(err) => {
                error!("KPI expiry task failed: {}", err);
                0
            }
        }
    }

    /// Recomputes every KRA's cached `overall_score` from its Active KPIs.
    /// Unchanged goals are skipped so the nightly run does not grow their
    /// logs.
    async fn recompute_overall_scores(&self) -> usize {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<usize, ApiError> {
            let mut conn = pool.get()?;
            let goal_rows = goals::table
                .select((goals::id, goals::overall_score))
                .load::<(Uuid, Option<bigdecimal::BigDecimal>)>(&mut conn)?;

            let mut rescored = 0;
            for (goal_id, current) in goal_rows {
                match recompute_one(&mut conn, goal_id, current) {
                    Ok(true) => rescored += 1,
                    Ok(false) => {}
                    Err(err) => error!("rescore of KRA {} failed: {}", goal_id, err),
                }
            }
            Ok(rescored)
        })
        .await;

        match result {
            Ok(Ok(count)) => count,
            Ok(Err(err)) => {
                error!("KRA rescore pass failed: {}", err);
                0
            }
            Err(err) => {
                error!("KRA rescore task failed: {}", err);
                0
            }
        }
    }

    /// Reminds the assignee (employee first, manager otherwise) of every
    /// Active KPI due within the configured window.
    async fn send_due_reminders(&self, today: NaiveDate) -> usize {
        let horizon = today + Duration::days(self.config.reminder_days);
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(
            move || -> Result<Vec<(MetricRecord, GoalRecord)>, ApiError> {
                let mut conn = pool.get()?;
                let rows = metrics::table
                    .inner_join(goals::table)
                    .filter(metrics::status.eq(MetricStatus::Active.as_str()))
                    .filter(metrics::due_date.ge(today))
                    .filter(metrics::due_date.le(horizon))
                    .select((MetricRecord::as_select(), GoalRecord::as_select()))
                    .load::<(MetricRecord, GoalRecord)>(&mut conn)?;
                Ok(rows)
            },
        )
        .await;

        let rows = match result {
            Ok(Ok(rows)) => rows,
            Ok(Err(err)) => {
                error!("reminder pass failed: {}", err);
                return 0;
            }
            Err(err) => {
                error!("reminder task failed: {}", err);
                return 0;
            }
        };

        let mut sent = 0;
        for (metric, goal) in rows {
            let Some(due) = metric.due_date else { continue };
            let recipient = goal
                .employee_name
                .clone()
                .or_else(|| goal.manager_name.clone());
            let Some(name) = recipient else {
                warn!("KPI {} due {} has nobody to remind", metric.id, due);
                continue;
            };
            let body = format!(
                "KPI \"{}\" under KRA \"{}\" is due on {}.",
                metric.name, goal.name, due
            );
            let email = self.directory.email_by_name(&name).await.ok().flatten();
            notify_best_effort(
                self.notifier.as_ref(),
                Notification::to_name(name, "KPI due soon", body).with_email(email),
            )
            .await;
            sent += 1;
        }
        sent
    }

    /// Builds one HTML summary per department and distributes it to that
    /// department's managers plus an admin broadcast.
    pub async fn run_weekly_report(&self) {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(
            move || -> Result<(Vec<GoalRecord>, Vec<MetricRecord>), ApiError> {
                let mut conn = pool.get()?;
                let goal_rows = goals::table
                    .order(goals::department.asc())
                    .select(GoalRecord::as_select())
                    .load::<GoalRecord>(&mut conn)?;
                let metric_rows = metrics::table
                    .select(MetricRecord::as_select())
                    .load::<MetricRecord>(&mut conn)?;
                Ok((goal_rows, metric_rows))
            },
        )
        .await;

        let (goal_rows, metric_rows) = match result {
            Ok(Ok(rows)) => rows,
            Ok(Err(err)) => {
                error!("weekly report query failed: {}", err);
                return;
            }
            Err(err) => {
                error!("weekly report task failed: {}", err);
                return;
            }
        };

        let mut metrics_by_goal: HashMap<Uuid, Vec<MetricRecord>> = HashMap::new();
        for metric in metric_rows {
            metrics_by_goal.entry(metric.goal_id).or_default().push(metric);
        }
        let mut by_department: BTreeMap<String, Vec<(GoalRecord, Vec<MetricRecord>)>> =
            BTreeMap::new();
        for goal in goal_rows {
            let attached = metrics_by_goal.remove(&goal.id).unwrap_or_default();
            by_department
                .entry(goal.department.clone())
                .or_default()
                .push((goal, attached));
        }

        let week_of = today_local();
        for (department, entries) in by_department {
            let html = render_department_report(&department, week_of, &entries);
            let body = match self.renderer.render(&html) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(err) => {
                    error!("report for {} failed to render: {}", department, err);
                    continue;
                }
            };
            let subject = format!("Weekly KRA report: {}", department);

            notify_best_effort(
                self.notifier.as_ref(),
                Notification::broadcast(Role::Admin, subject.clone(), body.clone()),
            )
            .await;

            let managers = match self.directory.members(Role::Manager, Some(&department)).await {
                Ok(managers) => managers,
                Err(err) => {
                    error!("manager lookup for {} failed: {}", department, err);
                    continue;
                }
            };
            for manager in managers {
                notify_best_effort(
                    self.notifier.as_ref(),
                    Notification::to_name(manager.name.clone(), subject.clone(), body.clone())
                        .with_email(Some(manager.email.clone())),
                )
                .await;
            }
        }
        info!("weekly report distributed");
    }
}

fn upcoming(schedule: &Schedule) -> Option<DateTime<Utc>> {
    schedule
        .upcoming(chrono::Local)
        .take(1)
        .next()
        .map(|at| at.with_timezone(&Utc))
}

fn recompute_one(
    conn: &mut PgConnection,
    goal_id: Uuid,
    current: Option<bigdecimal::BigDecimal>,
) -> Result<bool, ApiError> {
    let score_rows = metrics::table
        .filter(metrics::goal_id.eq(goal_id))
        .filter(metrics::status.eq(MetricStatus::Active.as_str()))
        .select(metrics::score)
        .load::<Option<bigdecimal::BigDecimal>>(conn)?;
    let scores: Vec<f64> = score_rows
        .into_iter()
        .flatten()
        .filter_map(|d| d.to_f64())
        .collect();
    let mean = aggregate_score(&scores);

    let next_value = mean.map_or(Value::Null, |m| json!(m));
    if audit::decimal_to_value(&current) == next_value {
        return Ok(false);
    }

    let mut changes = ChangeMap::new();
    changes.insert("overall_score".to_string(), next_value);
    audit::record_goal_change(conn, goal_id, &changes, SYSTEM_ACTOR)?;
    Ok(true)
}

pub fn render_department_report(
    department: &str,
    week_of: NaiveDate,
    entries: &[(GoalRecord, Vec<MetricRecord>)],
) -> String {
    let mut html = format!(
        "<h2>Weekly KRA report: {} (week of {})</h2>\
         <table border=\"1\" cellpadding=\"4\">\
         <tr><th>KRA</th><th>Assigned to</th><th>Overall score</th>\
         <th>Active KPIs</th><th>Ended KPIs</th></tr>",
        department, week_of
    );
    for (goal, attached) in entries {
        let active = attached
            .iter()
            .filter(|m| m.status == MetricStatus::Active.as_str())
            .count();
        let ended = attached.len() - active;
        let assigned = goal
            .employee_name
            .as_deref()
            .or(goal.manager_name.as_deref())
            .unwrap_or("-");
        let score = goal
            .overall_score
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            goal.name, assigned, score, active, ended
        ));
    }
    html.push_str("</table>");
    html
}

pub async fn run_maintenance(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<Json<ApiResponse<DailySummary>>, ApiError> {
    require_role(&user, &[Role::Admin])?;
    info!("manual maintenance run requested by {}", user.name);
    let job = MaintenanceJob::from_state(&state);
    let summary = job.run_daily().await;
    Ok(Json(ApiResponse::ok(summary)))
}

pub fn configure_maintenance_routes() -> Router<Arc<AppState>> {
    Router::new().route("/maintenance/run", post(run_maintenance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;

    #[test]
    fn aggregate_score_is_the_mean_of_present_scores() {
        assert_eq!(aggregate_score(&[]), None);
        assert_eq!(aggregate_score(&[40.0, 60.0]), Some(50.0));
        assert_eq!(aggregate_score(&[75.0]), Some(75.0));
    }

    #[test]
    fn passthrough_renderer_keeps_html() {
        let rendered = HtmlPassthrough.render("<h2>x</h2>").unwrap();
        assert_eq!(rendered, b"<h2>x</h2>");
    }

    #[test]
    fn department_report_lists_each_goal_with_kpi_counts() {
        let goal_id = Uuid::new_v4();
        let goal = GoalRecord {
            id: goal_id,
            name: "Q1 Sales".to_string(),
            definition: "quarterly revenue".to_string(),
            department: "Sales".to_string(),
            manager_name: Some("Asha Rao".to_string()),
            employee_name: None,
            created_by: "Root Admin".to_string(),
            scoring_method: "percent".to_string(),
            target: None,
            overall_score: BigDecimal::from_str("50").ok(),
            created_at: Utc::now(),
        };
        let metric = |status: &str| MetricRecord {
            id: Uuid::new_v4(),
            goal_id,
            name: "Close deals".to_string(),
            definition: "count of closed deals".to_string(),
            due_date: None,
            scoring_method: "percent".to_string(),
            target: None,
            score: None,
            comments: None,
            status: status.to_string(),
            created_by: "Ben Ortiz".to_string(),
            created_at: Utc::now(),
        };

        let entries = vec![(goal, vec![metric("Active"), metric("Active"), metric("End")])];
        let html = render_department_report("Sales", today_local(), &entries);
        assert!(html.contains("Weekly KRA report: Sales"));
        assert!(html.contains("Q1 Sales"));
        assert!(html.contains("Asha Rao"));
        assert!(html.contains("<td>2</td><td>1</td>"));
    }
}
