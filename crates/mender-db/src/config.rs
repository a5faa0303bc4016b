use std::env;

/// Connection settings for the engine's PostgreSQL store.
///
/// Resolution order (CLI flag > env var > config file > default) is the
/// caller's business; this type only reads the environment fallback and
/// derives sibling-database URLs from whatever was chosen.
#[derive(Debug, Clone)]
pub struct DbConfig {
    url: String,
}

impl DbConfig {
    /// Connection URL assumed when nothing else is configured.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/mender";

    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Read `MENDER_DATABASE_URL`, falling back to [`Self::DEFAULT_URL`].
    pub fn from_env() -> Self {
        match env::var("MENDER_DATABASE_URL") {
            Ok(url) if !url.is_empty() => Self { url },
            _ => Self::new(Self::DEFAULT_URL),
        }
    }

    /// The full connection URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The database name, i.e. the last path segment of the URL.
    pub fn database_name(&self) -> Option<&str> {
        let (_, name) = self.url.rsplit_once('/')?;
        (!name.is_empty()).then_some(name)
    }

    /// Point at a different database on the same server.
    ///
    /// Used for the `postgres` maintenance connection and for per-test
    /// databases.
    pub fn with_database(&self, name: &str) -> Self {
        match self.url.rsplit_once('/') {
            Some((server, _)) => Self::new(format!("{server}/{name}")),
            None => Self::new(format!("{}/{name}", self.url)),
        }
    }
}
