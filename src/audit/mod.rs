//! Versioned entity store. Every KRA/KPI mutation funnels through
//! `record_goal_change` / `record_metric_change` so the current row and its
//! append-only log move together in one transaction.

use std::collections::BTreeMap;
use std::str::FromStr;

use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::goals::GoalRecord;
use crate::metrics::{derive_metric_status, MetricRecord};
use crate::schema::{goal_logs, goals, metric_logs, metrics};
use crate::shared::error::ApiError;
use crate::shared::utils::today_local;

/// Raw field map as submitted by callers: field name to requested new value.
pub type ChangeMap = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDelta {
    pub from: Value,
    pub to: Value,
}

/// Computed diff for one write. BTreeMap keeps the serialized key order
/// stable.
pub type ChangeSet = BTreeMap<String, FieldDelta>;

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = goal_logs)]
pub struct GoalLogRecord {
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
    pub target: Option<BigDecimal>,
    pub overall_score: Option<BigDecimal>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
    pub changes: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = metric_logs)]
pub struct MetricLogRecord {
    pub id: Uuid,
    pub kpi_id: Uuid,
    pub version: i32,
    pub name: String,
    pub definition: String,
    pub due_date: Option<NaiveDate>,
    pub scoring_method: String,
    pub target: Option<BigDecimal>,
    pub score: Option<BigDecimal>,
    pub comments: Option<String>,
    pub status: String,
    pub goal_id: Uuid,
    pub goal_name: String,
    pub department: String,
    pub created_by: String,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
    pub changes: Option<String>,
}

/// Versions are contiguous from 0, so the next one is always max + 1.
pub fn next_version(current_max: Option<i32>) -> i32 {
    current_max.map_or(0, |v| v + 1)
}

/// Serialized diff for the log row. Empty diffs store NULL, which is also
/// what creation rows carry; a no-op save therefore produces a log row
/// whose `changes` is NULL while the version still advances.
pub fn encode_changes(delta: &ChangeSet) -> Option<String> {
    if delta.is_empty() {
        None
    } else {
        serde_json::to_string(delta).ok()
    }
}

/// Parse a stored `changes` column back into JSON for API responses.
pub fn parse_changes(raw: Option<&str>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(s).ok())
}

/// Numbers arrive as integers or floats depending on the client; fold both
/// onto f64 so `50` and `50.0` compare equal and no-op detection holds.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) => serde_json::json!(f),
            None => value.clone(),
        },
        other => other.clone(),
    }
}

pub(crate) fn decimal_to_value(value: &Option<BigDecimal>) -> Value {
    match value {
        Some(d) => d.to_f64().map(|f| serde_json::json!(f)).unwrap_or(Value::Null),
        None => Value::Null,
    }
}

fn value_to_decimal(field: &str, value: &Value) -> Result<Option<BigDecimal>, ApiError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => BigDecimal::from_str(&n.to_string())
            .map(Some)
            .map_err(|_| ApiError::Validation(format!("{} must be numeric", field))),
        _ => Err(ApiError::Validation(format!("{} must be numeric", field))),
    }
}

/// DTO floats go through their shortest decimal repr so the stored value
/// matches what the client typed, not a binary expansion of it.
pub fn decimal_from_f64(field: &str, value: f64) -> Result<BigDecimal, ApiError> {
    BigDecimal::from_str(&value.to_string())
        .map_err(|_| ApiError::Validation(format!("{} must be a finite number", field)))
}

fn opt_string_to_value(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::String(s.clone()),
        None => Value::Null,
    }
}

fn value_to_string(field: &str, value: &Value) -> Result<String, ApiError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        _ => Err(ApiError::Validation(format!("{} must be a string", field))),
    }
}

fn value_to_opt_string(field: &str, value: &Value) -> Result<Option<String>, ApiError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        _ => Err(ApiError::Validation(format!("{} must be a string", field))),
    }
}

fn date_to_value(value: &Option<NaiveDate>) -> Value {
    match value {
        Some(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        None => Value::Null,
    }
}

/// Accepts plain dates and full RFC 3339 timestamps; clients have sent both.
pub fn value_to_date(field: &str, value: &Value) -> Result<Option<NaiveDate>, ApiError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => {
            if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return Ok(Some(d));
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(Some(dt.date_naive()));
            }
            Err(ApiError::Validation(format!(
                "{} must be a YYYY-MM-DD date",
                field
            )))
        }
        _ => Err(ApiError::Validation(format!(
            "{} must be a YYYY-MM-DD date",
            field
        ))),
    }
}

fn goal_field_value(record: &GoalRecord, field: &str) -> Result<Value, ApiError> {
    match field {
        "name" => Ok(Value::String(record.name.clone())),
        "definition" => Ok(Value::String(record.definition.clone())),
        "target" => Ok(decimal_to_value(&record.target)),
        "manager_name" => Ok(opt_string_to_value(&record.manager_name)),
        "employee_name" => Ok(opt_string_to_value(&record.employee_name)),
        "overall_score" => Ok(decimal_to_value(&record.overall_score)),
        other => Err(ApiError::Validation(format!(
            "field {} is not editable on a KRA",
            other
        ))),
    }
}

fn apply_goal_field(record: &mut GoalRecord, field: &str, value: &Value) -> Result<(), ApiError> {
    match field {
        "name" => record.name = value_to_string(field, value)?,
        "definition" => record.definition = value_to_string(field, value)?,
        "target" => record.target = value_to_decimal(field, value)?,
        "manager_name" => record.manager_name = value_to_opt_string(field, value)?,
        "employee_name" => record.employee_name = value_to_opt_string(field, value)?,
        "overall_score" => record.overall_score = value_to_decimal(field, value)?,
        other => {
            return Err(ApiError::Validation(format!(
                "field {} is not editable on a KRA",
                other
            )))
        }
    }
    Ok(())
}

/// Walks the submitted map, drops fields whose value already matches, and
/// mutates `record` in place for the rest. Returns the recorded diff with
/// `from` as the pre-write value (JSON null when the column was NULL).
pub fn diff_goal(record: &mut GoalRecord, changes: &ChangeMap) -> Result<ChangeSet, ApiError> {
    let mut delta = ChangeSet::new();
    for (field, new_value) in changes {
        let current = goal_field_value(record, field)?;
        let incoming = canonical(new_value);
        if canonical(&current) == incoming {
            continue;
        }
        apply_goal_field(record, field, &incoming)?;
        delta.insert(
            field.clone(),
            FieldDelta {
                from: current,
                to: incoming,
            },
        );
    }
    Ok(delta)
}

fn metric_field_value(record: &MetricRecord, field: &str) -> Result<Value, ApiError> {
    match field {
        "name" => Ok(Value::String(record.name.clone())),
        "def" => Ok(Value::String(record.definition.clone())),
        "due_date" => Ok(date_to_value(&record.due_date)),
        "scoring_method" => Ok(Value::String(record.scoring_method.clone())),
        "target" => Ok(decimal_to_value(&record.target)),
        "score" => Ok(decimal_to_value(&record.score)),
        "comments" => Ok(opt_string_to_value(&record.comments)),
        other => Err(ApiError::Validation(format!(
            "field {} is not editable on a KPI",
            other
        ))),
    }
}

fn apply_metric_field(
    record: &mut MetricRecord,
    field: &str,
    value: &Value,
) -> Result<(), ApiError> {
    match field {
        "name" => record.name = value_to_string(field, value)?,
        "def" => record.definition = value_to_string(field, value)?,
        "due_date" => record.due_date = value_to_date(field, value)?,
        "scoring_method" => record.scoring_method = value_to_string(field, value)?,
        "target" => record.target = value_to_decimal(field, value)?,
        "score" => record.score = value_to_decimal(field, value)?,
        "comments" => record.comments = value_to_opt_string(field, value)?,
        other => {
            return Err(ApiError::Validation(format!(
                "field {} is not editable on a KPI",
                other
            )))
        }
    }
    Ok(())
}

/// KPI counterpart of [`diff_goal`]. The `def` key maps onto the
/// `definition` column; the wire name is kept for client compatibility.
pub fn diff_metric(record: &mut MetricRecord, changes: &ChangeMap) -> Result<ChangeSet, ApiError> {
    let mut delta = ChangeSet::new();
    for (field, new_value) in changes {
        let current = metric_field_value(record, field)?;
        let incoming = canonical(new_value);
        if canonical(&current) == incoming {
            continue;
        }
        apply_metric_field(record, field, &incoming)?;
        delta.insert(
            field.clone(),
            FieldDelta {
                from: current,
                to: incoming,
            },
        );
    }
    Ok(delta)
}

fn append_goal_log(
    conn: &mut PgConnection,
    record: &GoalRecord,
    changes: Option<String>,
    actor: &str,
) -> Result<i32, ApiError> {
    let max: Option<i32> = goal_logs::table
        .filter(goal_logs::goal_id.eq(record.id))
        .select(diesel::dsl::max(goal_logs::version))
        .first(conn)?;
    let version = next_version(max);

    let log = GoalLogRecord {
        id: Uuid::new_v4(),
        goal_id: record.id,
        version,
        name: record.name.clone(),
        definition: record.definition.clone(),
        department: record.department.clone(),
        manager_name: record.manager_name.clone(),
        employee_name: record.employee_name.clone(),
        created_by: record.created_by.clone(),
        scoring_method: record.scoring_method.clone(),
        target: record.target.clone(),
        overall_score: record.overall_score.clone(),
        updated_by: actor.to_string(),
        updated_at: Utc::now(),
        changes,
    };
    diesel::insert_into(goal_logs::table)
        .values(&log)
        .execute(conn)?;
    Ok(version)
}

fn append_metric_log(
    conn: &mut PgConnection,
    record: &MetricRecord,
    changes: Option<String>,
    actor: &str,
) -> Result<i32, ApiError> {
    let (goal_name, department) = goals::table
        .find(record.goal_id)
        .select((goals::name, goals::department))
        .first::<(String, String)>(conn)?;

    let max: Option<i32> = metric_logs::table
        .filter(metric_logs::kpi_id.eq(record.id))
        .select(diesel::dsl::max(metric_logs::version))
        .first(conn)?;
    let version = next_version(max);

    let log = MetricLogRecord {
        id: Uuid::new_v4(),
        kpi_id: record.id,
        version,
        name: record.name.clone(),
        definition: record.definition.clone(),
        due_date: record.due_date,
        scoring_method: record.scoring_method.clone(),
        target: record.target.clone(),
        score: record.score.clone(),
        comments: record.comments.clone(),
        status: record.status.clone(),
        goal_id: record.goal_id,
        goal_name,
        department,
        created_by: record.created_by.clone(),
        updated_by: actor.to_string(),
        updated_at: Utc::now(),
        changes,
    };
    diesel::insert_into(metric_logs::table)
        .values(&log)
        .execute(conn)?;
    Ok(version)
}

/// Inserts the KRA row together with its version 0 snapshot.
pub fn record_goal_creation(
    conn: &mut PgConnection,
    record: &GoalRecord,
    actor: &str,
) -> Result<(), ApiError> {
    conn.transaction::<_, ApiError, _>(|conn| {
        diesel::insert_into(goals::table)
            .values(record)
            .execute(conn)?;
        append_goal_log(conn, record, None, actor)?;
        Ok(())
    })
}

/// Applies `changes` to the KRA and appends the next log version. The row
/// is locked for the duration of the transaction so concurrent writers
/// line up and versions stay contiguous.
pub fn record_goal_change(
    conn: &mut PgConnection,
    goal_id: Uuid,
    changes: &ChangeMap,
    actor: &str,
) -> Result<GoalRecord, ApiError> {
    conn.transaction::<_, ApiError, _>(|conn| {
        let mut record = goals::table
            .find(goal_id)
            .select(GoalRecord::as_select())
            .for_update()
            .first::<GoalRecord>(conn)
            .optional()?
            .ok_or_else(|| ApiError::NotFound(format!("KRA {} not found", goal_id)))?;

        let delta = diff_goal(&mut record, changes)?;
        diesel::update(goals::table.find(goal_id))
            .set(&record)
            .execute(conn)?;
        append_goal_log(conn, &record, encode_changes(&delta), actor)?;
        Ok(record)
    })
}

/// Inserts the KPI row together with its version 0 snapshot.
pub fn record_metric_creation(
    conn: &mut PgConnection,
    record: &MetricRecord,
    actor: &str,
) -> Result<(), ApiError> {
    conn.transaction::<_, ApiError, _>(|conn| {
        diesel::insert_into(metrics::table)
            .values(record)
            .execute(conn)?;
        append_metric_log(conn, record, None, actor)?;
        Ok(())
    })
}

/// KPI counterpart of [`record_goal_change`]. After the diff is applied
/// the status is re-derived from the (possibly new) due date, and a flip
/// is folded into the same diff and the same log row.
pub fn record_metric_change(
    conn: &mut PgConnection,
    kpi_id: Uuid,
    changes: &ChangeMap,
    actor: &str,
) -> Result<MetricRecord, ApiError> {
    conn.transaction::<_, ApiError, _>(|conn| {
        let mut record = metrics::table
            .find(kpi_id)
            .select(MetricRecord::as_select())
            .for_update()
            .first::<MetricRecord>(conn)
            .optional()?
            .ok_or_else(|| ApiError::NotFound(format!("KPI {} not found", kpi_id)))?;

        let mut delta = diff_metric(&mut record, changes)?;

        let derived = derive_metric_status(record.due_date.as_ref(), today_local());
        if derived.as_str() != record.status {
            delta.insert(
                "status".to_string(),
                FieldDelta {
                    from: Value::String(record.status.clone()),
                    to: Value::String(derived.as_str().to_string()),
                },
            );
            record.status = derived.as_str().to_string();
        }

        diesel::update(metrics::table.find(kpi_id))
            .set(&record)
            .execute(conn)?;
        append_metric_log(conn, &record, encode_changes(&delta), actor)?;
        Ok(record)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_goal() -> GoalRecord {
        GoalRecord {
            id: Uuid::new_v4(),
            name: "Q3 Revenue".to_string(),
            definition: "Grow quarterly revenue".to_string(),
            department: "Sales".to_string(),
            manager_name: Some("Asha Rao".to_string()),
            employee_name: None,
            created_by: "Asha Rao".to_string(),
            scoring_method: "percentage".to_string(),
            target: Some(BigDecimal::from_str("100").unwrap()),
            overall_score: None,
            created_at: Utc::now(),
        }
    }

    fn sample_metric(due: Option<NaiveDate>) -> MetricRecord {
        MetricRecord {
            id: Uuid::new_v4(),
            goal_id: Uuid::new_v4(),
            name: "Close 10 deals".to_string(),
            definition: "Ten closed-won opportunities".to_string(),
            due_date: due,
            scoring_method: "count".to_string(),
            target: Some(BigDecimal::from_str("10").unwrap()),
            score: None,
            comments: None,
            status: "Active".to_string(),
            created_by: "Ben Ortiz".to_string(),
            created_at: Utc::now(),
        }
    }

    fn map(pairs: &[(&str, Value)]) -> ChangeMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn versions_start_at_zero_and_increment() {
        assert_eq!(next_version(None), 0);
        assert_eq!(next_version(Some(0)), 1);
        assert_eq!(next_version(Some(41)), 42);
    }

    #[test]
    fn diff_records_old_and_new_values() {
        let mut record = sample_goal();
        let delta = diff_goal(
            &mut record,
            &map(&[
                ("name", json!("Q4 Revenue")),
                ("employee_name", json!("Ben Ortiz")),
            ]),
        )
        .unwrap();

        assert_eq!(record.name, "Q4 Revenue");
        assert_eq!(record.employee_name.as_deref(), Some("Ben Ortiz"));
        assert_eq!(delta["name"].from, json!("Q3 Revenue"));
        assert_eq!(delta["name"].to, json!("Q4 Revenue"));
        // previously unset field diffs from JSON null
        assert_eq!(delta["employee_name"].from, Value::Null);
    }

    #[test]
    fn unchanged_fields_are_dropped_from_the_diff() {
        let mut record = sample_goal();
        let delta = diff_goal(
            &mut record,
            &map(&[
                ("name", json!("Q3 Revenue")),
                ("definition", json!("Grow quarterly revenue")),
            ]),
        )
        .unwrap();
        assert!(delta.is_empty());
        assert_eq!(encode_changes(&delta), None);
    }

    #[test]
    fn integer_and_float_forms_compare_equal() {
        let mut record = sample_goal();
        let delta = diff_goal(&mut record, &map(&[("target", json!(100))])).unwrap();
        assert!(delta.is_empty(), "100 should equal the stored 100.0");

        let delta = diff_goal(&mut record, &map(&[("target", json!(120))])).unwrap();
        assert_eq!(delta["target"].from, json!(100.0));
        assert_eq!(delta["target"].to, json!(120.0));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut record = sample_goal();
        let err = diff_goal(&mut record, &map(&[("department", json!("Support"))]));
        assert!(matches!(err, Err(ApiError::Validation(_))));

        let mut metric = sample_metric(None);
        let err = diff_metric(&mut metric, &map(&[("status", json!("End"))]));
        assert!(matches!(err, Err(ApiError::Validation(_))));
    }

    #[test]
    fn metric_def_key_maps_to_definition() {
        let mut metric = sample_metric(None);
        let delta = diff_metric(&mut metric, &map(&[("def", json!("New wording"))])).unwrap();
        assert_eq!(metric.definition, "New wording");
        assert_eq!(delta["def"].from, json!("Ten closed-won opportunities"));
    }

    #[test]
    fn nulling_a_field_is_a_recorded_change() {
        let mut record = sample_goal();
        let delta = diff_goal(&mut record, &map(&[("manager_name", Value::Null)])).unwrap();
        assert_eq!(record.manager_name, None);
        assert_eq!(delta["manager_name"].from, json!("Asha Rao"));
        assert_eq!(delta["manager_name"].to, Value::Null);
    }

    #[test]
    fn encoded_changes_round_trip_through_parse() {
        let mut record = sample_goal();
        let delta = diff_goal(&mut record, &map(&[("target", json!(80))])).unwrap();
        let raw = encode_changes(&delta).unwrap();
        let parsed = parse_changes(Some(&raw)).unwrap();
        assert_eq!(parsed["target"]["from"], json!(100.0));
        assert_eq!(parsed["target"]["to"], json!(80.0));
    }

    #[test]
    fn date_values_accept_both_wire_formats() {
        let plain = value_to_date("due_date", &json!("2026-09-01")).unwrap();
        assert_eq!(plain, NaiveDate::from_ymd_opt(2026, 9, 1));

        let stamped = value_to_date("due_date", &json!("2026-09-01T00:00:00Z")).unwrap();
        assert_eq!(stamped, NaiveDate::from_ymd_opt(2026, 9, 1));

        assert!(value_to_date("due_date", &json!("01/09/2026")).is_err());
        assert!(value_to_date("due_date", &json!(20260901)).is_err());
    }

    #[test]
    fn decimal_values_reject_non_numbers() {
        assert!(value_to_decimal("target", &json!("eighty")).is_err());
        assert_eq!(value_to_decimal("target", &Value::Null).unwrap(), None);
        assert_eq!(
            value_to_decimal("target", &json!(12.5)).unwrap(),
            Some(BigDecimal::from_str("12.5").unwrap())
        );
    }
}
