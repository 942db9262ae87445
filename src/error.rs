use serde::Serialize;

/// Typed failure crossing a component boundary. The `code` is stable and
/// maps one-to-one onto the IPC error envelope.
#[derive(Debug, Clone, Serialize)]
pub struct CoreError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CoreError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new("storage_failed", message)
    }

    pub fn conversion(message: impl Into<String>) -> Self {
        Self::new("conversion_failed", message)
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::new("invalid_transition", message)
    }

    pub fn invalid_score(message: impl Into<String>) -> Self {
        Self::new("invalid_score", message)
    }
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CoreError {}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::storage(e.to_string())
    }
}
