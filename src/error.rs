use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Internal error"))]
    Internal {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Serialization error"))]
    Serde {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Broker error on topic {topic}: {message}"))]
    Broker { topic: String, message: String },

    #[snafu(display("Could not decode record {topic}@{offset}: {message}"))]
    Decode {
        topic: String,
        offset: i64,
        message: String,
    },

    #[snafu(display("Invalid ISO-8601 duration {input:?}: {message}"))]
    InvalidDuration { input: String, message: String },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serde { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::Internal { source: Some(e) }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::Internal {
            source: Some(e.into()),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn broker(topic: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Broker {
            topic: topic.into(),
            message: message.to_string(),
        }
    }

    /// True when the store rejected a write because another writer holds the lock.
    pub fn is_contention(&self) -> bool {
        match self {
            Self::Sqlx { source } => sqlx_contention(source),
            Self::Internal {
                source: Some(report),
            } => report
                .downcast_ref::<sqlx::Error>()
                .is_some_and(sqlx_contention),
            _ => false,
        }
    }
}

fn sqlx_contention(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            let message = db.message();
            message.contains("database is locked") || message.contains("database is busy")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}
