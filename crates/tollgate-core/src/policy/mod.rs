//! Policy enforcement around tool execution.
//!
//! A [`PolicyEnforcer`] holds per-tool lists of *before* and *after*
//! policies plus a private [`PolicyContext`] that persists for the lifetime of
//! the enforcer. Every tool call made through [`PolicyEnforcer::wrap_call`]:
//!
//! 1. runs each before-policy for the call's normalized name, in registration
//!    order, stopping at the first denial;
//! 2. runs the executor;
//! 3. runs each after-policy with the executor's result, stopping at the first
//!    denial.
//!
//! A denial at either stage fails the call with [`PolicyError::Violation`].
//! A denial in the after stage discards the result even though the tool has
//! already run.
//!
//! # Name normalization
//!
//! Backends often namespace tool names (`mcpx_fetch`). Policies are keyed by
//! the bare name: everything up to and including the first occurrence of the
//! namespace delimiter is stripped. A name without the delimiter is used as-is.

use std::{collections::HashMap, fmt, future::Future};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::invoker::ToolInvocation;

pub mod limits;

/// Delimiter separating a backend namespace from a tool name.
pub const DEFAULT_NAMESPACE_DELIMITER: char = '_';

/// Reason used when a policy denies a call without saying why.
pub const DEFAULT_DENIAL_REASON: &str = "denied by policy";

/// Stage of policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStage {
    Before,
    After,
}

impl fmt::Display for PolicyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Before => f.write_str("before"),
            Self::After => f.write_str("after"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PolicyError {
    /// A policy denied the call.
    #[error("Policy violation: {reason}")]
    Violation {
        tool: String,
        stage: PolicyStage,
        reason: String,
    },

    /// Policies cannot be registered for an empty tool name.
    #[error("policy tool name must not be empty")]
    EmptyToolName,
}

/// Outcome of a single policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyVerdict {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl PolicyVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Mutable key/value state shared by all policies of one enforcer.
///
/// Only policies see the context: the enforcer passes it to each evaluation
/// and exposes no other access.
#[derive(Debug)]
pub struct PolicyContext {
    state: HashMap<String, Value>,
}

impl PolicyContext {
    pub(crate) fn new() -> Self {
        Self {
            state: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    /// Stores `value` under `key`, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.state.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.state.remove(key)
    }
}

/// A check run before or after a tool executes.
///
/// `result` is `None` for before-policies and the tool's output for
/// after-policies.
#[async_trait]
pub trait Policy: Send + Sync {
    async fn evaluate(
        &self,
        call: &ToolInvocation,
        context: &mut PolicyContext,
        result: Option<&Value>,
    ) -> PolicyVerdict;
}

/// A [`Policy`] backed by a synchronous closure. See [`policy_fn`].
pub struct PolicyFn<F>(F);

/// Wraps a closure as a [`Policy`].
///
/// ```
/// use tollgate_core::policy::{PolicyEnforcer, PolicyVerdict, policy_fn};
///
/// let mut enforcer = PolicyEnforcer::new();
/// enforcer
///     .add_before_policy(
///         "delete",
///         policy_fn(|_call, _context, _result| PolicyVerdict::deny("read-only session")),
///     )
///     .unwrap();
/// ```
pub fn policy_fn<F>(f: F) -> PolicyFn<F>
where
    F: Fn(&ToolInvocation, &mut PolicyContext, Option<&Value>) -> PolicyVerdict + Send + Sync,
{
    PolicyFn(f)
}

#[async_trait]
impl<F> Policy for PolicyFn<F>
where
    F: Fn(&ToolInvocation, &mut PolicyContext, Option<&Value>) -> PolicyVerdict + Send + Sync,
{
    async fn evaluate(
        &self,
        call: &ToolInvocation,
        context: &mut PolicyContext,
        result: Option<&Value>,
    ) -> PolicyVerdict {
        (self.0)(call, context, result)
    }
}

type PolicyTable = HashMap<String, Vec<Box<dyn Policy>>>;

/// Runs registered policies around tool execution.
pub struct PolicyEnforcer {
    before: PolicyTable,
    after: PolicyTable,
    context: PolicyContext,
    delimiter: char,
}

impl fmt::Debug for PolicyEnforcer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEnforcer")
            .field("before", &self.before.keys().collect::<Vec<_>>())
            .field("after", &self.after.keys().collect::<Vec<_>>())
            .field("delimiter", &self.delimiter)
            .finish_non_exhaustive()
    }
}

impl Default for PolicyEnforcer {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEnforcer {
    pub fn new() -> Self {
        Self::with_delimiter(DEFAULT_NAMESPACE_DELIMITER)
    }

    pub fn with_delimiter(delimiter: char) -> Self {
        Self {
            before: HashMap::new(),
            after: HashMap::new(),
            context: PolicyContext::new(),
            delimiter,
        }
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    pub fn add_before_policy(
        &mut self,
        tool: &str,
        policy: impl Policy + 'static,
    ) -> Result<(), PolicyError> {
        Self::insert(&mut self.before, tool, Box::new(policy))
    }

    pub fn add_after_policy(
        &mut self,
        tool: &str,
        policy: impl Policy + 'static,
    ) -> Result<(), PolicyError> {
        Self::insert(&mut self.after, tool, Box::new(policy))
    }

    fn insert(
        table: &mut PolicyTable,
        tool: &str,
        policy: Box<dyn Policy>,
    ) -> Result<(), PolicyError> {
        if tool.trim().is_empty() {
            return Err(PolicyError::EmptyToolName);
        }
        table.entry(tool.to_owned()).or_default().push(policy);
        Ok(())
    }

    /// Strips the namespace prefix from a tool name.
    pub fn normalize_tool_name<'a>(&self, name: &'a str) -> &'a str {
        name.split_once(self.delimiter)
            .map_or(name, |(_, rest)| rest)
    }

    /// Runs `executor` for `call`, gated by the policies for its tool.
    ///
    /// The executor receives its own copy of the call and is not run at all
    /// when a before-policy denies.
    #[instrument(skip_all, fields(tool = %call.name, call_id = %call.id))]
    pub async fn wrap_call<F, Fut, E>(
        &mut self,
        call: &ToolInvocation,
        executor: F,
    ) -> Result<Value, E>
    where
        F: FnOnce(ToolInvocation) -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: From<PolicyError>,
    {
        let tool = self.normalize_tool_name(&call.name);
        if tool.is_empty() {
            warn!("Tool name normalizes to an empty key; no policies apply");
        }

        if let Some(policies) = self.before.get(tool) {
            for policy in policies {
                let verdict = policy.evaluate(call, &mut self.context, None).await;
                if !verdict.allowed {
                    return Err(violation(tool, PolicyStage::Before, verdict).into());
                }
            }
        }

        let result = executor(call.clone()).await?;

        if let Some(policies) = self.after.get(tool) {
            for policy in policies {
                let verdict = policy
                    .evaluate(call, &mut self.context, Some(&result))
                    .await;
                if !verdict.allowed {
                    return Err(violation(tool, PolicyStage::After, verdict).into());
                }
            }
        }

        Ok(result)
    }
}

fn violation(tool: &str, stage: PolicyStage, verdict: PolicyVerdict) -> PolicyError {
    let reason = verdict
        .reason
        .unwrap_or_else(|| DEFAULT_DENIAL_REASON.to_owned());
    debug!(%stage, %reason, "Policy denied tool call");
    PolicyError::Violation {
        tool: tool.to_owned(),
        stage,
        reason,
    }
}
