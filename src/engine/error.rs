use thiserror::Error;

/// Errors raised by a circuit engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No circuit is loaded")]
    NoActiveCircuit,

    #[error("Unknown feeder '{requested}'. Available feeders: {}", available.join(", "))]
    UnknownFeeder {
        requested: String,
        available: Vec<String>,
    },

    #[error("Bus '{0}' not found in circuit")]
    UnknownBus(String),

    #[error("Element '{0}' not found in circuit")]
    UnknownElement(String),

    #[error("Element '{0}' already exists")]
    DuplicateElement(String),

    #[error("Invalid feeder template: {0}")]
    InvalidTemplate(String),

    #[error("Failed to parse feeder template: {0}")]
    TemplateParse(#[from] toml::de::Error),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("No converged solution available")]
    NotSolved,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_feeder_lists_available() {
        let err = EngineError::UnknownFeeder {
            requested: "IEEE999".to_string(),
            available: vec!["IEEE13".to_string(), "IEEE34".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Unknown feeder 'IEEE999'. Available feeders: IEEE13, IEEE34"
        );
    }

    #[test]
    fn test_unknown_bus_display() {
        let err = EngineError::UnknownBus("999".to_string());
        assert_eq!(err.to_string(), "Bus '999' not found in circuit");
    }
}
