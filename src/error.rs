use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaroError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Persistence is disabled")]
    PersistenceDisabled,

    #[error("Unsupported interruption signal: {0}")]
    UnsupportedSignal(i32),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid job pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a plugin fails to load.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {0} not found")]
    NotFound(String),

    #[error("plugin {0} returned no listener")]
    NoListener(String),

    #[error("plugin {name} factory failed: {reason}")]
    Factory { name: String, reason: String },

    #[error("plugin {name} factory panicked: {reason}")]
    Panicked { name: String, reason: String },
}

pub type Result<T, E = TaroError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(TaroError::PersistenceDisabled.to_string(), "Persistence is disabled");
        assert_eq!(
            TaroError::UnsupportedSignal(2).to_string(),
            "Unsupported interruption signal: 2"
        );
        let err: TaroError = PluginError::NoListener("taro_x".into()).into();
        assert_eq!(err.to_string(), "Plugin error: plugin taro_x returned no listener");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TaroError>();
    }
}
