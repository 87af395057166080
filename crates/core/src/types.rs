/// All database primary keys are BIGSERIAL (i64).
pub type DbId = i64;

/// All timestamps are TIMESTAMPTZ (UTC).
pub type Timestamp = chrono::DateTime<chrono::Utc>;
