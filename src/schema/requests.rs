diesel::table! {
    /// Change requests raised against a KPI. Requester and approver are
    /// denormalized as role plus canonical name; `approver_name` null means
    /// any holder of `approver_role` may decide. `requested_changes` holds
    /// the raw field map as JSON text; `action` is edit or delete.
    metric_change_requests (id) {
        id -> Uuid,
        kpi_id -> Uuid,
        kpi_name -> Varchar,
        kra_id -> Uuid,
        kra_name -> Varchar,
        department -> Varchar,
        requester_role -> Varchar,
        requester_name -> Varchar,
        approver_role -> Varchar,
        approver_name -> Nullable<Varchar>,
        requested_changes -> Text,
        action -> Varchar,
        request_comment -> Nullable<Text>,
        status -> Varchar,
        decision_comment -> Nullable<Text>,
        decided_by -> Nullable<Varchar>,
        decided_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    /// Change requests raised against a KRA. Always decided by an Admin.
    /// Deletion travels as the `_action: "delete"` sentinel inside
    /// `requested_changes` rather than a separate action column.
    goal_change_requests (id) {
        id -> Uuid,
        kra_id -> Uuid,
        kra_name -> Varchar,
        department -> Varchar,
        requester_role -> Varchar,
        requester_name -> Varchar,
        approver_role -> Varchar,
        approver_name -> Nullable<Varchar>,
        requested_changes -> Text,
        request_comment -> Nullable<Text>,
        status -> Varchar,
        decision_comment -> Nullable<Text>,
        decided_by -> Nullable<Varchar>,
        decided_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(metric_change_requests, goal_change_requests);
