//! Recognizes provider errors caused by an invalid tool parameter schema.
//!
//! When a declared tool's parameter schema is rejected, the provider answers
//! with an `invalid_request_error` whose `code` is
//! `invalid_function_parameters` and whose `param` points at the tool by
//! position, for example `tools[3].function.parameters`. Matching is narrow:
//! anything else is handed back untouched.

use std::{error::Error, fmt};

use crate::{completion::CompletionError, tool::ToolDefinition};

pub const INVALID_REQUEST_ERROR: &str = "invalid_request_error";
pub const INVALID_FUNCTION_PARAMETERS: &str = "invalid_function_parameters";

/// A completion failure attributed to one declared tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchemaError {
    tool_index: usize,
    tool_name: Option<String>,
    source: CompletionError,
}

impl ToolSchemaError {
    /// Classifies `error` against the tools that were declared with the
    /// failing request.
    ///
    /// Returns the original error unchanged when it is not a tool schema
    /// error. An index beyond `tools` is still classified, without a name.
    pub fn classify(
        error: CompletionError,
        tools: &[ToolDefinition],
    ) -> Result<Self, CompletionError> {
        let Some(tool_index) = schema_error_index(&error) else {
            return Err(error);
        };

        Ok(Self {
            tool_index,
            tool_name: tools.get(tool_index).map(|tool| tool.name().to_owned()),
            source: error,
        })
    }

    pub fn tool_index(&self) -> usize {
        self.tool_index
    }

    /// Name of the offending tool, when the index is within the declared list.
    pub fn tool_name(&self) -> Option<&str> {
        self.tool_name.as_deref()
    }

    pub fn original(&self) -> &CompletionError {
        &self.source
    }

    pub fn into_original(self) -> CompletionError {
        self.source
    }

    fn provider_message(&self) -> &str {
        self.source
            .api_detail()
            .map_or("", |detail| detail.message.as_str())
    }
}

impl fmt::Display for ToolSchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tool_name {
            Some(name) => write!(
                f,
                "invalid parameter schema for tool `{name}` (tools[{}]): {}",
                self.tool_index,
                self.provider_message()
            ),
            None => write!(
                f,
                "invalid parameter schema for undeclared tool at tools[{}]: {}",
                self.tool_index,
                self.provider_message()
            ),
        }
    }
}

impl Error for ToolSchemaError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

fn schema_error_index(error: &CompletionError) -> Option<usize> {
    let detail = error.api_detail()?;
    if detail.kind.as_deref() != Some(INVALID_REQUEST_ERROR)
        || detail.code.as_deref() != Some(INVALID_FUNCTION_PARAMETERS)
    {
        return None;
    }
    tool_index(detail.param.as_deref()?)
}

/// Extracts `N` from the first path segment of the form `tools[N]`.
fn tool_index(param: &str) -> Option<usize> {
    let rest = param
        .split('.')
        .find_map(|segment| segment.strip_prefix("tools["))?;
    let (digits, _) = rest.split_once(']')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
