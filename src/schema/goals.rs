diesel::table! {
    /// KRA (Key Result Area) rows. `manager_name` and `employee_name` are
    /// stored as canonical display names, matching the directory.
    goals (id) {
        id -> Uuid,
        name -> Varchar,
        definition -> Text,
        department -> Varchar,
        manager_name -> Nullable<Varchar>,
        employee_name -> Nullable<Varchar>,
        created_by -> Varchar,
        scoring_method -> Varchar,
        target -> Nullable<Numeric>,
        overall_score -> Nullable<Numeric>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    /// Append-only version history for KRAs. One row per write, carrying a
    /// full snapshot of the row after the write plus a JSON diff of what
    /// changed. `version` starts at 0 on creation and increments by one per
    /// write, unique per goal.
    goal_logs (id) {
        id -> Uuid,
        goal_id -> Uuid,
        version -> Int4,
        name -> Varchar,
        definition -> Text,
        department -> Varchar,
        manager_name -> Nullable<Varchar>,
        employee_name -> Nullable<Varchar>,
        created_by -> Varchar,
        scoring_method -> Varchar,
        target -> Nullable<Numeric>,
        overall_score -> Nullable<Numeric>,
        updated_by -> Varchar,
        updated_at -> Timestamptz,
        changes -> Nullable<Text>,
    }
}

diesel::table! {
    /// KPI rows, always owned by a parent KRA. `status` is derived from
    /// `due_date` on every write: Active while the due date has not passed,
    /// End afterwards.
    metrics (id) {
        id -> Uuid,
        goal_id -> Uuid,
        name -> Varchar,
        definition -> Text,
        due_date -> Nullable<Date>,
        scoring_method -> Varchar,
        target -> Nullable<Numeric>,
        score -> Nullable<Numeric>,
        comments -> Nullable<Text>,
        status -> Varchar,
        created_by -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    /// Append-only version history for KPIs. Snapshots denormalize the
    /// parent KRA's name and department so log queries never need a join
    /// back to a row that may since have been deleted.
    metric_logs (id) {
        id -> Uuid,
        kpi_id -> Uuid,
        version -> Int4,
        name -> Varchar,
        definition -> Text,
        due_date -> Nullable<Date>,
        scoring_method -> Varchar,
        target -> Nullable<Numeric>,
        score -> Nullable<Numeric>,
        comments -> Nullable<Text>,
        status -> Varchar,
        goal_id -> Uuid,
        goal_name -> Varchar,
        department -> Varchar,
        created_by -> Varchar,
        updated_by -> Varchar,
        updated_at -> Timestamptz,
        changes -> Nullable<Text>,
    }
}

diesel::joinable!(goal_logs -> goals (goal_id));
diesel::joinable!(metrics -> goals (goal_id));

diesel::allow_tables_to_appear_in_same_query!(goals, goal_logs, metrics, metric_logs);
