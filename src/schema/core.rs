diesel::table! {
    /// Directory of every account known to the tracker. `role` holds the
    /// normalized lowercase role string (admin, manager, employee).
    users (id) {
        id -> Uuid,
        name -> Varchar,
        email -> Varchar,
        role -> Varchar,
        department -> Nullable<Varchar>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    departments (id) {
        id -> Uuid,
        name -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    /// In-app notification feed. A row targets either a single recipient by
    /// canonical name or every holder of a role (broadcast) when
    /// `recipient_name` is null.
    notifications (id) {
        id -> Uuid,
        recipient_name -> Nullable<Varchar>,
        recipient_role -> Nullable<Varchar>,
        subject -> Varchar,
        body -> Text,
        read_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(users, departments, notifications);
