use crate::provider::ProviderError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The call ran out of tool rounds. `last_content` is the best partial
    /// answer the model produced along the way.
    #[error("Iteration limit exceeded after {iterations} tool rounds")]
    IterationLimitExceeded {
        iterations: usize,
        last_content: Option<String>,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("Tool already registered: {0}")]
    DuplicateTool(String),
}

impl AgentError {
    /// Partial answer carried by an iteration-limit error.
    pub fn last_content(&self) -> Option<&str> {
        match self {
            AgentError::IterationLimitExceeded { last_content, .. } => last_content.as_deref(),
            _ => None,
        }
    }

    /// Text shown to a channel user when a call fails.
    pub fn user_message(&self) -> String {
        match self {
            AgentError::IterationLimitExceeded {
                iterations,
                last_content: Some(partial),
            } => format!("{partial}\n\n(stopped after {iterations} tool rounds)"),
            other => format!("Error: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_with_partial() {
        let err = AgentError::IterationLimitExceeded {
            iterations: 5,
            last_content: Some("BTC looks flat".into()),
        };
        assert_eq!(err.last_content(), Some("BTC looks flat"));
        assert_eq!(
            err.user_message(),
            "BTC looks flat\n\n(stopped after 5 tool rounds)"
        );
    }

    #[test]
    fn test_user_message_plain() {
        let err = AgentError::Provider(ProviderError::Request("502".into()));
        assert_eq!(err.user_message(), "Error: Provider error: Request failed: 502");
        assert!(err.last_content().is_none());
    }
}
