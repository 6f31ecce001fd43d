use crate::connection::IsolationLevel;
use crate::core::{DbError, Result};
use std::future::Future;
use tracing::Dispatch;
use tracing::instrument::WithSubscriber;

const URL_SCHEME: &str = "memodocs://";

/// Store configuration
///
/// Fixed when the store is built and shared by all of its sessions.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Prepended to every table name
    pub table_prefix: String,

    /// Isolation level of flush transactions
    pub isolation_level: IsolationLevel,

    /// Commands sent per round trip when the connection supports batching (0 or 1 disables)
    pub command_batch_size: usize,

    /// Subscriber receiving this store's events; the ambient default when unset
    pub dispatch: Option<Dispatch>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table_prefix: String::new(),
            isolation_level: IsolationLevel::ReadCommitted,
            command_batch_size: 32,
            dispatch: None,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table_prefix(mut self, prefix: &str) -> Self {
        self.table_prefix = prefix.to_string();
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn command_batch_size(mut self, size: usize) -> Self {
        self.command_batch_size = size;
        self
    }

    /// Route the store's tracing events to `dispatch`
    pub fn dispatch(mut self, dispatch: impl Into<Dispatch>) -> Self {
        self.dispatch = Some(dispatch.into());
        self
    }

    /// Parse from a connection string
    ///
    /// Format: `memodocs://[name][?table_prefix=app_&isolation=serializable&batch_size=32]`.
    /// The name part is informational.
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| DbError::ParseError(format!("URL must start with '{}'", URL_SCHEME)))?;

        let mut config = Self::new();
        let Some((_, query)) = rest.split_once('?') else {
            return Ok(config);
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| DbError::ParseError(format!("Expected key=value, got '{}'", pair)))?;
            match key {
                "table_prefix" => config.table_prefix = value.to_string(),
                "isolation" => config.isolation_level = value.parse()?,
                "batch_size" => {
                    config.command_batch_size = value
                        .parse()
                        .map_err(|_| DbError::ParseError(format!("Invalid batch_size '{}'", value)))?
                }
                other => return Err(DbError::ParseError(format!("Unknown option '{}'", other))),
            }
        }
        Ok(config)
    }

    pub fn to_url(&self) -> String {
        format!(
            "{}?table_prefix={}&isolation={}&batch_size={}",
            URL_SCHEME,
            self.table_prefix,
            self.isolation_level.to_string().to_lowercase().replace(' ', "_"),
            self.command_batch_size
        )
    }

    /// Run `future` with this store's subscriber, if any
    pub(crate) async fn scope<F: Future>(&self, future: F) -> F::Output {
        match &self.dispatch {
            Some(dispatch) => future.with_subscriber(dispatch.clone()).await,
            None => future.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_url() {
        let config =
            StoreConfig::from_url("memodocs://blog?table_prefix=app_&isolation=serializable&batch_size=8")
                .unwrap();
        assert_eq!(config.table_prefix, "app_");
        assert_eq!(config.isolation_level, IsolationLevel::Serializable);
        assert_eq!(config.command_batch_size, 8);

        let defaults = StoreConfig::from_url("memodocs://").unwrap();
        assert_eq!(defaults.isolation_level, IsolationLevel::ReadCommitted);
        assert!(defaults.table_prefix.is_empty());
    }

    #[test]
    fn test_url_round_trip() {
        let config = StoreConfig::new()
            .table_prefix("t_")
            .isolation_level(IsolationLevel::RepeatableRead)
            .command_batch_size(4);
        let parsed = StoreConfig::from_url(&config.to_url()).unwrap();
        assert_eq!(parsed.table_prefix, "t_");
        assert_eq!(parsed.isolation_level, IsolationLevel::RepeatableRead);
        assert_eq!(parsed.command_batch_size, 4);
    }

    #[test]
    fn test_invalid_urls() {
        assert!(StoreConfig::from_url("postgres://localhost").is_err());
        assert!(StoreConfig::from_url("memodocs://?isolation=chaos").is_err());
        assert!(StoreConfig::from_url("memodocs://?batch_size=many").is_err());
        assert!(StoreConfig::from_url("memodocs://?colour=blue").is_err());
    }
}
