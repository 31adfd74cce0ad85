use chrono::NaiveDate;
use diesel::r2d2::{ConnectionManager, Pool, PoolError};
use diesel::PgConnection;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn create_conn() -> Result<DbPool, PoolError> {
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://postgres:@localhost:5432/trackify".to_string());
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder().build(manager)
}

/// Calendar date in the server's local timezone. Due-date comparisons are
/// whole-day comparisons against this, not against UTC instants.
pub fn today_local() -> NaiveDate {
    chrono::Local::now().date_naive()
}
