#[cfg(test)]
mod workflow_integration_tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::extract::{Path, Query, State};
    use axum::http::{header, Request, StatusCode};
    use axum::Json;
    use chrono::Duration;
    use diesel::prelude::*;
    use diesel::r2d2::{ConnectionManager, Pool};
    use diesel::PgConnection;
    use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use trackify_server::api_router::configure_api_routes;
    use trackify_server::auth::{AuthUser, Role};
    use trackify_server::config::AppConfig;
    use trackify_server::directory::{StaticDirectory, UserProfile};
    use trackify_server::goals::{self, Goal, GoalCreation};
    use trackify_server::maintenance::MaintenanceJob;
    use trackify_server::metrics::{self, Metric};
    use trackify_server::notify::{PgNotifier, RecordingNotifier};
    use trackify_server::requests::{self, kpi, kra};
    use trackify_server::schema::{
        goal_logs, goals as goals_table, metric_logs, metrics as metrics_table,
    };
    use trackify_server::shared::error::ApiError;
    use trackify_server::shared::state::AppState;
    use trackify_server::shared::utils::{today_local, DbPool};
    use trackify_server::tests::test_util::{profile, test_state};
    use trackify_server::{assert_err, assert_ok};

    const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

    // ------------------------------------------------------------------
    // HTTP-level gates. These go through the router with a pool that never
    // connects, because every request is rejected before the handler needs
    // the database.
    // ------------------------------------------------------------------

    fn authed(method: &str, uri: &str, name: &str, role: &str, body: Option<Value>) -> Request<Body> {
        let email = format!("{}@example.com", name.to_lowercase().replace(' ', "."));
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-user-name", name)
            .header("x-user-email", email)
            .header("x-user-role", role);
        match body {
            Some(value) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn requests_without_identity_headers_are_unauthorized() {
        let app = configure_api_routes().with_state(test_state(Vec::new()));
        let request = Request::builder().uri("/kra").body(Body::empty()).unwrap();
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], json!(false));
    }

    #[tokio::test]
    async fn unknown_roles_are_rejected_at_the_door() {
        let app = configure_api_routes().with_state(test_state(Vec::new()));
        let request = authed("GET", "/kra", "Dana Cole", "supervisor", None);
        let (status, _) = send(app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn employees_cannot_create_kras() {
        let app = configure_api_routes().with_state(test_state(Vec::new()));
        let request = authed(
            "POST",
            "/kra/create",
            "Dev Patel",
            "employee",
            Some(json!({"name": "Release quality"})),
        );
        let (status, _) = send(app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn kra_creation_requires_the_core_fields() {
        let app = configure_api_routes().with_state(test_state(Vec::new()));
        let request = authed("POST", "/kra/create", "Root Admin", "admin", Some(json!({})));
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("name"));
    }

    #[tokio::test]
    async fn change_requests_reject_fields_off_the_allow_list() {
        let app = configure_api_routes().with_state(test_state(Vec::new()));
        // score is deliberately not requestable on a KPI
        let request = authed(
            "POST",
            "/requests/kpi-change",
            "Dev Patel",
            "employee",
            Some(json!({
                "kpi_id": Uuid::new_v4(),
                "requested_changes": {"score": 99}
            })),
        );
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("score"));
    }

    #[tokio::test]
    async fn admins_do_not_submit_change_requests() {
        let app = configure_api_routes().with_state(test_state(Vec::new()));
        let request = authed(
            "POST",
            "/requests/kpi-change",
            "Root Admin",
            "admin",
            Some(json!({
                "kpi_id": Uuid::new_v4(),
                "requested_changes": {"target": 60}
            })),
        );
        let (status, _) = send(app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn maintenance_runs_are_admin_only() {
        let app = configure_api_routes().with_state(test_state(Vec::new()));
        let request = authed("POST", "/maintenance/run", "Asha Rao", "manager", None);
        let (status, _) = send(app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    // ------------------------------------------------------------------
    // Full workflows against Postgres. Skipped when no database is
    // reachable so the suite stays runnable on a bare checkout.
    // ------------------------------------------------------------------

    fn db_pool() -> Option<DbPool> {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://postgres:@localhost:5432/trackify_test".to_string());
        let manager = ConnectionManager::<PgConnection>::new(url);
        let pool = match Pool::builder().max_size(4).build(manager) {
            Ok(pool) => pool,
            Err(_) => return None,
        };
        let mut conn = match pool.get() {
            Ok(conn) => conn,
            Err(_) => return None,
        };
        if conn.run_pending_migrations(MIGRATIONS).is_err() {
            return None;
        }
        Some(pool)
    }

    /// One isolated cast per test: names and the department carry a random
    /// tag so runs sharing a database never see each other's rows.
    struct Workspace {
        state: Arc<AppState>,
        notifier: Arc<RecordingNotifier>,
        dept: String,
        admin: AuthUser,
        manager: AuthUser,
        employee: AuthUser,
        coworker: AuthUser,
        third: AuthUser,
    }

    fn auth(profile: &UserProfile) -> AuthUser {
        AuthUser {
            name: profile.name.clone(),
            email: profile.email.clone(),
            role: profile.role,
        }
    }

    fn workspace(pool: DbPool) -> Workspace {
        let id = Uuid::new_v4().to_string();
        let tag = &id[..8];
        let dept = format!("Quality {}", tag);
        let admin = profile(
            &format!("Root Admin {}", tag),
            &format!("root.{}@example.com", tag),
            Role::Admin,
            None,
        );
        let manager = profile(
            &format!("Asha Rao {}", tag),
            &format!("asha.{}@example.com", tag),
            Role::Manager,
            Some(&dept),
        );
        let employee = profile(
            &format!("Dev Patel {}", tag),
            &format!("dev.{}@example.com", tag),
            Role::Employee,
            Some(&dept),
        );
        let coworker = profile(
            &format!("Mina Lee {}", tag),
            &format!("mina.{}@example.com", tag),
            Role::Employee,
            Some(&dept),
        );
        let third = profile(
            &format!("Omar Haddad {}", tag),
            &format!("omar.{}@example.com", tag),
            Role::Employee,
            Some(&dept),
        );
        let notifier = Arc::new(RecordingNotifier::new());
        let state = Arc::new(AppState::new(
            pool,
            AppConfig::default(),
            Arc::new(StaticDirectory::new(vec![
                admin.clone(),
                manager.clone(),
                employee.clone(),
                coworker.clone(),
                third.clone(),
            ])),
            notifier.clone(),
        ));
        Workspace {
            state,
            notifier,
            dept,
            admin: auth(&admin),
            manager: auth(&manager),
            employee: auth(&employee),
            coworker: auth(&coworker),
            third: auth(&third),
        }
    }

    async fn create_kra(ws: &Workspace, name: &str, employee: Option<&str>) -> Goal {
        let response = goals::create_goal(
            State(ws.state.clone()),
            ws.admin.clone(),
            Json(goals::CreateGoalRequest {
                name: Some(name.to_string()),
                definition: Some("Keep the release defect rate in check".to_string()),
                scoring_method: Some("percentage".to_string()),
                target: Some(90.0),
                dept: Some(ws.dept.clone()),
                manager_name: Some(ws.manager.name.clone()),
                employee_name: employee.map(str::to_string),
            }),
        )
        .await
        .expect("KRA creation failed");
        match response.0.data.expect("KRA creation returned no data") {
            GoalCreation::Single(goal) => goal,
            GoalCreation::Many(_) => panic!("expected a single KRA"),
        }
    }

    async fn create_kpi(
        ws: &Workspace,
        kra_id: Uuid,
        name: &str,
        due: Option<chrono::NaiveDate>,
        target: f64,
    ) -> Metric {
        let response = metrics::create_metric(
            State(ws.state.clone()),
            ws.manager.clone(),
            Json(metrics::CreateMetricRequest {
                kra_id: Some(kra_id),
                name: Some(name.to_string()),
                def: Some("Share of releases shipped without a rollback".to_string()),
                scoring_method: Some("percentage".to_string()),
                due_date: due.map(|d| d.format("%Y-%m-%d").to_string()),
                target: Some(target),
                comments: None,
            }),
        )
        .await
        .expect("KPI creation failed");
        response.0.data.expect("KPI creation returned no data")
    }

    async fn set_score(ws: &Workspace, kpi_id: Uuid, score: f64) {
        metrics::update_metric(
            State(ws.state.clone()),
            ws.manager.clone(),
            Path(kpi_id),
            Json(metrics::UpdateMetricRequest {
                name: None,
                def: None,
                due_date: None,
                scoring_method: None,
                target: None,
                score: Some(score),
                comments: None,
            }),
        )
        .await
        .expect("KPI score update failed");
    }

    fn goal_history(pool: &DbPool, goal_id: Uuid) -> Vec<(i32, Option<String>, String)> {
        let mut conn = pool.get().expect("pool checkout failed");
        goal_logs::table
            .filter(goal_logs::goal_id.eq(goal_id))
            .order(goal_logs::version.asc())
            .select((goal_logs::version, goal_logs::changes, goal_logs::updated_by))
            .load(&mut conn)
            .expect("goal log query failed")
    }

    fn metric_history(pool: &DbPool, kpi_id: Uuid) -> Vec<(i32, Option<String>)> {
        let mut conn = pool.get().expect("pool checkout failed");
        metric_logs::table
            .filter(metric_logs::kpi_id.eq(kpi_id))
            .order(metric_logs::version.asc())
            .select((metric_logs::version, metric_logs::changes))
            .load(&mut conn)
            .expect("metric log query failed")
    }

    #[tokio::test]
    async fn kra_history_versions_are_contiguous_from_zero() {
        let pool = match db_pool() {
            Some(pool) => pool,
            None => {
                println!("Skipping test - Postgres not available");
                return;
            }
        };
        let ws = workspace(pool.clone());
        let goal = create_kra(&ws, "Release quality", None).await;

        for target in [91.0, 92.0, 93.0] {
            goals::update_goal(
                State(ws.state.clone()),
                ws.admin.clone(),
                Path(goal.id),
                Json(goals::UpdateGoalRequest {
                    name: None,
                    definition: None,
                    target: Some(target),
                    manager_name: None,
                    employee_name: None,
                }),
            )
            .await
            .expect("KRA update failed");
        }

        let history = goal_history(&pool, goal.id);
        let versions: Vec<i32> = history.iter().map(|(v, _, _)| *v).collect();
        assert_eq!(versions, vec![0, 1, 2, 3]);

        // the creation snapshot carries no diff; every edit does
        assert!(history[0].1.is_none());
        for (_, changes, _) in &history[1..] {
            let diff: Value = serde_json::from_str(changes.as_deref().unwrap()).unwrap();
            assert!(diff.get("target").is_some());
        }
    }

    #[tokio::test]
    async fn saving_without_changes_still_appends_a_log_row() {
        let pool = match db_pool() {
            Some(pool) => pool,
            None => {
                println!("Skipping test - Postgres not available");
                return;
            }
        };
        let ws = workspace(pool.clone());
        let goal = create_kra(&ws, "Release quality", None).await;

        // same target as at creation, so the diff is empty
        goals::update_goal(
            State(ws.state.clone()),
            ws.admin.clone(),
            Path(goal.id),
            Json(goals::UpdateGoalRequest {
                name: None,
                definition: None,
                target: Some(90.0),
                manager_name: None,
                employee_name: None,
            }),
        )
        .await
        .expect("no-op KRA update failed");

        let history = goal_history(&pool, goal.id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].0, 1);
        assert!(history[1].1.is_none(), "no-op save must store a NULL diff");
    }

    #[tokio::test]
    async fn assigning_to_all_fans_out_one_kra_per_employee() {
        let pool = match db_pool() {
            Some(pool) => pool,
            None => {
                println!("Skipping test - Postgres not available");
                return;
            }
        };
        let ws = workspace(pool.clone());

        let response = goals::create_goal(
            State(ws.state.clone()),
            ws.manager.clone(),
            Json(goals::CreateGoalRequest {
                name: Some("Incident response drills".to_string()),
                definition: Some("Run one tabletop drill per quarter".to_string()),
                scoring_method: Some("count".to_string()),
                target: Some(4.0),
                dept: None,
                manager_name: None,
                employee_name: Some("all".to_string()),
            }),
        )
        .await
        .expect("fan-out creation failed");

        let created = match response.0.data.expect("fan-out returned no data") {
            GoalCreation::Many(goals) => goals,
            GoalCreation::Single(_) => panic!("expected one KRA per employee"),
        };
        assert_eq!(created.len(), 3);

        let mut assignees: Vec<String> = created
            .iter()
            .map(|g| g.employee_name.clone().expect("fan-out row without assignee"))
            .collect();
        assignees.sort();
        let mut expected = vec![
            ws.employee.name.clone(),
            ws.coworker.name.clone(),
            ws.third.name.clone(),
        ];
        expected.sort();
        assert_eq!(assignees, expected);

        // each copy starts its own history at version 0
        for goal in &created {
            let history = goal_history(&pool, goal.id);
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].0, 0);
        }
    }

    #[tokio::test]
    async fn employee_kpi_request_approved_by_manager_updates_the_kpi() {
        let pool = match db_pool() {
            Some(pool) => pool,
            None => {
                println!("Skipping test - Postgres not available");
                return;
            }
        };
        let ws = workspace(pool.clone());
        let goal = create_kra(&ws, "Release quality", Some(&ws.employee.name)).await;
        let kpi = create_kpi(&ws, goal.id, "Rollback rate", None, 50.0).await;

        let submitted = kpi::submit_metric_change(
            State(ws.state.clone()),
            ws.employee.clone(),
            Json(kpi::SubmitMetricChangeRequest {
                kpi_id: Some(kpi.id),
                requested_changes: Some(
                    json!({"target": 60}).as_object().cloned().unwrap(),
                ),
                request_comment: Some("Target was set before the Q3 re-org".to_string()),
                action: None,
                approver_name: None,
            }),
        )
        .await
        .expect("KPI change submission failed");
        let request = submitted.0.data.expect("submission returned no data");
        assert_eq!(request.status, "Pending");
        assert_eq!(request.approver_role, "manager");
        // the parent KRA names a manager, so the request is addressed to them
        assert_eq!(request.approver_name.as_deref(), Some(ws.manager.name.as_str()));

        let decided = kpi::approve_metric_request(
            State(ws.state.clone()),
            ws.manager.clone(),
            Path(request.id),
            Some(Json(requests::DecisionRequest {
                comment: Some("Agreed, 60 is the right bar".to_string()),
            })),
        )
        .await
        .expect("approval failed");
        let decided = decided.0.data.expect("approval returned no data");
        assert_eq!(decided.status, "Approved");
        assert_eq!(decided.decided_by.as_deref(), Some(ws.manager.name.as_str()));
        assert!(decided.decided_at.is_some());

        // the approved edit landed on the KPI itself
        let reloaded = metrics::get_metric(
            State(ws.state.clone()),
            ws.admin.clone(),
            Path(kpi.id),
        )
        .await
        .expect("KPI reload failed");
        let reloaded = reloaded.0.data.unwrap();
        assert_eq!(reloaded.target, Some(60.0));

        // and produced the next log version with the recorded delta
        let history = metric_history(&pool, kpi.id);
        assert_eq!(history.len(), 2);
        let diff: Value = serde_json::from_str(history[1].1.as_deref().unwrap()).unwrap();
        assert_eq!(diff["target"]["from"], json!(50.0));
        assert_eq!(diff["target"]["to"], json!(60.0));

        // submitter heard about the submission routing and the decision
        let sent = ws.notifier.sent();
        assert!(sent.iter().any(|n| {
            n.subject == "KPI change request"
                && n.recipient_name.as_deref() == Some(ws.manager.name.as_str())
        }));
        assert!(sent.iter().any(|n| {
            n.subject == "KPI change request decided"
                && n.recipient_name.as_deref() == Some(ws.employee.name.as_str())
                && n.body.contains("approved")
        }));
    }

    #[tokio::test]
    async fn second_decision_on_a_request_conflicts() {
        let pool = match db_pool() {
            Some(pool) => pool,
            None => {
                println!("Skipping test - Postgres not available");
                return;
            }
        };
        let ws = workspace(pool.clone());
        let goal = create_kra(&ws, "Release quality", Some(&ws.employee.name)).await;
        let kpi = create_kpi(&ws, goal.id, "Rollback rate", None, 50.0).await;

        let submitted = kpi::submit_metric_change(
            State(ws.state.clone()),
            ws.employee.clone(),
            Json(kpi::SubmitMetricChangeRequest {
                kpi_id: Some(kpi.id),
                requested_changes: Some(
                    json!({"target": 60}).as_object().cloned().unwrap(),
                ),
                request_comment: None,
                action: None,
                approver_name: None,
            }),
        )
        .await
        .expect("KPI change submission failed");
        let request = submitted.0.data.unwrap();

        assert_ok!(
            kpi::reject_metric_request(
                State(ws.state.clone()),
                ws.manager.clone(),
                Path(request.id),
                None,
            )
            .await
        );

        let err = assert_err!(
            kpi::approve_metric_request(
                State(ws.state.clone()),
                ws.manager.clone(),
                Path(request.id),
                None,
            )
            .await
        );
        assert!(matches!(err, ApiError::Conflict(_)));

        // the rejected edit never reached the KPI
        let reloaded = metrics::get_metric(
            State(ws.state.clone()),
            ws.admin.clone(),
            Path(kpi.id),
        )
        .await
        .expect("KPI reload failed");
        assert_eq!(reloaded.0.data.unwrap().target, Some(50.0));
    }

    #[tokio::test]
    async fn approved_kra_deletion_request_removes_the_kra_and_its_kpis() {
        let pool = match db_pool() {
            Some(pool) => pool,
            None => {
                println!("Skipping test - Postgres not available");
                return;
            }
        };
        let ws = workspace(pool.clone());
        let goal = create_kra(&ws, "Legacy migration", Some(&ws.employee.name)).await;
        let kpi = create_kpi(&ws, goal.id, "Tables migrated", None, 100.0).await;

        let submitted = kra::submit_goal_change(
            State(ws.state.clone()),
            ws.manager.clone(),
            Json(kra::SubmitGoalChangeRequest {
                kra_id: Some(goal.id),
                requested_changes: Some(
                    json!({"_action": "delete"}).as_object().cloned().unwrap(),
                ),
                request_comment: Some("Superseded by the platform rewrite".to_string()),
                approver_name: None,
            }),
        )
        .await
        .expect("KRA deletion request failed");
        let request = submitted.0.data.unwrap();
        assert_eq!(request.approver_role, "admin");
        // no admin was named, so the request went out as a role broadcast
        assert!(request.approver_name.is_none());
        assert!(ws.notifier.sent().iter().any(|n| {
            n.recipient_role == Some(Role::Admin)
                && n.recipient_name.is_none()
                && n.body.contains("deletion of")
        }));

        kra::approve_goal_request(
            State(ws.state.clone()),
            ws.admin.clone(),
            Path(request.id),
            None,
        )
        .await
        .expect("deletion approval failed");

        let mut conn = pool.get().unwrap();
        let goals_left: i64 = goals_table::table
            .filter(goals_table::id.eq(goal.id))
            .count()
            .get_result(&mut conn)
            .unwrap();
        assert_eq!(goals_left, 0);
        let kpis_left: i64 = metrics_table::table
            .filter(metrics_table::id.eq(kpi.id))
            .count()
            .get_result(&mut conn)
            .unwrap();
        assert_eq!(kpis_left, 0, "KPIs must go down with their KRA");

        // the request row itself survives as decision history
        let listed = kra::list_goal_requests(
            State(ws.state.clone()),
            ws.admin.clone(),
            Query(requests::RequestListQuery {
                scope: None,
                status: Some("approved".to_string()),
                kra_id: Some(goal.id),
            }),
        )
        .await
        .expect("request listing failed");
        let listed = listed.0.data.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, request.id);
    }

    #[tokio::test]
    async fn daily_maintenance_expires_overdue_kpis_and_rescores() {
        let pool = match db_pool() {
            Some(pool) => pool,
            None => {
                println!("Skipping test - Postgres not available");
                return;
            }
        };
        let ws = workspace(pool.clone());
        let today = today_local();
        let goal = create_kra(&ws, "Release quality", Some(&ws.employee.name)).await;

        let scored_a = create_kpi(&ws, goal.id, "Rollback rate", Some(today + Duration::days(30)), 95.0).await;
        let scored_b = create_kpi(&ws, goal.id, "Defect density", None, 95.0).await;
        let overdue = create_kpi(&ws, goal.id, "Patch latency", Some(today + Duration::days(5)), 95.0).await;
        let due_soon = create_kpi(&ws, goal.id, "Release notes", Some(today + Duration::days(2)), 95.0).await;

        set_score(&ws, scored_a.id, 40.0).await;
        set_score(&ws, scored_b.id, 60.0).await;
        set_score(&ws, overdue.id, 90.0).await;

        // backdate the due date without touching status, as if the sweep
        // had not run since the KPI fell due
        {
            let mut conn = pool.get().unwrap();
            diesel::update(metrics_table::table.find(overdue.id))
                .set(metrics_table::due_date.eq(Some(today - Duration::days(1))))
                .execute(&mut conn)
                .unwrap();
        }

        let job = MaintenanceJob::from_state(&ws.state);
        let summary = job.run_daily().await;
        assert!(summary.expired >= 1);

        // the overdue KPI flipped to End with a logged status delta
        let mut conn = pool.get().unwrap();
        let status: String = metrics_table::table
            .find(overdue.id)
            .select(metrics_table::status)
            .first(&mut conn)
            .unwrap();
        assert_eq!(status, "End");
        let history = metric_history(&pool, overdue.id);
        let last = history.last().unwrap();
        let diff: Value = serde_json::from_str(last.1.as_deref().unwrap()).unwrap();
        assert_eq!(diff["status"]["from"], json!("Active"));
        assert_eq!(diff["status"]["to"], json!("End"));

        // the expired KPI's score (90) is out of the mean: (40 + 60) / 2
        let reloaded = goals::get_goal(
            State(ws.state.clone()),
            ws.admin.clone(),
            Path(goal.id),
        )
        .await
        .expect("KRA reload failed");
        assert_eq!(reloaded.0.data.unwrap().overall_score, Some(50.0));

        // the recomputation is attributed to the system actor in the log
        let history = goal_history(&pool, goal.id);
        let rescore = history
            .iter()
            .rev()
            .find(|(_, changes, _)| {
                changes.as_deref().map_or(false, |c| c.contains("overall_score"))
            })
            .expect("no rescore log row");
        assert_eq!(rescore.2, "system");

        // the KPI due in two days triggered a reminder to its assignee
        assert!(ws.notifier.sent().iter().any(|n| {
            n.subject == "KPI due soon"
                && n.recipient_name.as_deref() == Some(ws.employee.name.as_str())
                && n.body.contains(&due_soon.name)
        }));

        // a second sweep finds the same mean and skips the no-op rewrite
        let before = goal_history(&pool, goal.id).len();
        job.run_daily().await;
        assert_eq!(goal_history(&pool, goal.id).len(), before);
    }

    #[tokio::test]
    async fn broadcast_notifications_reach_every_holder_of_the_role() {
        let pool = match db_pool() {
            Some(pool) => pool,
            None => {
                println!("Skipping test - Postgres not available");
                return;
            }
        };
        // Use the persisting notifier here so the feed endpoint has rows to
        // serve; everything else in the workspace is rebuilt around it.
        let ws = workspace(pool.clone());
        let state = Arc::new(AppState::new(
            pool.clone(),
            AppConfig::default(),
            Arc::clone(&ws.state.directory),
            Arc::new(PgNotifier::new(pool.clone(), None, None)),
        ));

        let goal = create_kra(&ws, "Unassigned initiative", None).await;
        {
            // drop the manager so the employee's request has nobody to
            // address by name
            let mut conn = pool.get().unwrap();
            diesel::update(goals_table::table.find(goal.id))
                .set((
                    goals_table::manager_name.eq(None::<String>),
                    goals_table::employee_name.eq(Some(ws.employee.name.clone())),
                ))
                .execute(&mut conn)
                .unwrap();
        }
        let kpi_name = format!("Adoption rate ({})", ws.dept);
        let kpi = create_kpi(&ws, goal.id, &kpi_name, None, 75.0).await;

        let submitted = kpi::submit_metric_change(
            State(state.clone()),
            ws.employee.clone(),
            Json(kpi::SubmitMetricChangeRequest {
                kpi_id: Some(kpi.id),
                requested_changes: Some(
                    json!({"target": 80}).as_object().cloned().unwrap(),
                ),
                request_comment: None,
                action: None,
                approver_name: None,
            }),
        )
        .await
        .expect("KPI change submission failed");
        let request = submitted.0.data.unwrap();
        assert_eq!(request.approver_role, "manager");
        assert!(request.approver_name.is_none());

        // any manager sees the broadcast in their feed; employees do not
        let feed = trackify_server::notify::list_notifications(
            State(state.clone()),
            ws.manager.clone(),
        )
        .await
        .expect("manager feed failed");
        assert!(feed
            .0
            .data
            .unwrap()
            .iter()
            .any(|n| n.body.contains(&kpi.name)));

        let feed = trackify_server::notify::list_notifications(
            State(state.clone()),
            ws.coworker.clone(),
        )
        .await
        .expect("employee feed failed");
        assert!(!feed
            .0
            .data
            .unwrap()
            .iter()
            .any(|n| n.body.contains(&kpi.name)));

        // and the broadcast can be claimed by a holder of the role
        let decided = kpi::approve_metric_request(
            State(state.clone()),
            ws.manager.clone(),
            Path(request.id),
            None,
        )
        .await
        .expect("broadcast approval failed");
        assert_eq!(decided.0.data.unwrap().status, "Approved");
    }
}
