use crate::{completion::CompletionError, schema_error::ToolSchemaError, tool::ToolDefinition};

/// Fatal conversation errors. Any of these aborts the current turn.
///
/// Tool failures are not represented here: they become tool messages in the
/// conversation log.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error(transparent)]
    Completion(#[from] CompletionError),

    /// The provider rejected a declared tool's parameter schema.
    #[error(transparent)]
    ToolSchema(#[from] ToolSchemaError),

    /// The operation is not allowed in the current turn state.
    #[error("illegal conversation state: {0}")]
    IllegalState(String),

    #[error("conversation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Attributes a completion failure to a declared tool when possible.
    pub(crate) fn from_completion(error: CompletionError, tools: &[ToolDefinition]) -> Self {
        match ToolSchemaError::classify(error, tools) {
            Ok(schema_error) => Self::ToolSchema(schema_error),
            Err(original) => Self::Completion(original),
        }
    }
}
