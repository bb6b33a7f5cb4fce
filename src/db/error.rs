use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database connection error: {0}")]
    Connection(String),
    #[error("database migration error: {0}")]
    Migration(String),
    #[error("database query error: {0}")]
    Query(String),
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("stored value could not be decoded: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Maps a diesel error, keeping unique violations distinguishable so callers
    /// can turn them into domain conflicts.
    pub fn from_diesel(err: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};

        match err {
            Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                DatabaseError::Conflict(info.message().to_string())
            }
            other => DatabaseError::Query(other.to_string()),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DatabaseError::Conflict(_))
    }
}

pub(crate) fn parse_snowflake(value: &str) -> Result<u64, DatabaseError> {
    value
        .parse::<u64>()
        .map_err(|e| DatabaseError::Serialization(format!("invalid snowflake {value:?}: {e}")))
}

pub(crate) fn parse_optional_snowflake(value: Option<&str>) -> Result<Option<u64>, DatabaseError> {
    value.map(parse_snowflake).transpose()
}
