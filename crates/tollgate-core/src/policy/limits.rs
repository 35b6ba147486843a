//! Per-host call limits for URL-taking tools.

use async_trait::async_trait;
use serde_json::{Map, Value};
use url::Url;

use super::{Policy, PolicyContext, PolicyEnforcer, PolicyError, PolicyVerdict};
use crate::invoker::ToolInvocation;

/// Argument read by default when no other name is configured.
pub const DEFAULT_URL_ARGUMENT: &str = "url";

/// Caps how many times a tool may be called for the same host.
///
/// Installs a before-policy that denies once a host has been called
/// `max_calls` times, and an after-policy that counts successful calls.
/// Counts live in the enforcer's context under `<tool>.host-counts`.
#[derive(Debug, Clone)]
pub struct HostCallLimit {
    tool: String,
    max_calls: u64,
    argument: String,
}

impl HostCallLimit {
    pub fn new(tool: impl Into<String>, max_calls: u64) -> Self {
        Self {
            tool: tool.into(),
            max_calls,
            argument: DEFAULT_URL_ARGUMENT.to_owned(),
        }
    }

    /// Reads the URL from `argument` instead of `url`.
    #[must_use]
    pub fn with_argument(mut self, argument: impl Into<String>) -> Self {
        self.argument = argument.into();
        self
    }

    pub fn install(self, enforcer: &mut PolicyEnforcer) -> Result<(), PolicyError> {
        let tool = self.tool.clone();
        enforcer.add_before_policy(&tool, HostCallGuard(self.clone()))?;
        enforcer.add_after_policy(&tool, HostCallCounter(self))
    }

    fn context_key(&self) -> String {
        format!("{}.host-counts", self.tool)
    }

    fn host(&self, call: &ToolInvocation) -> Result<String, String> {
        let raw = call
            .arguments
            .get(&self.argument)
            .and_then(Value::as_str)
            .ok_or_else(|| format!("argument `{}` must be a URL string", self.argument))?;
        let url = Url::parse(raw).map_err(|e| format!("invalid URL `{raw}`: {e}"))?;
        url.host_str()
            .map(str::to_owned)
            .ok_or_else(|| format!("URL `{raw}` has no host"))
    }

    fn count(&self, context: &PolicyContext, host: &str) -> u64 {
        context
            .get(&self.context_key())
            .and_then(|counts| counts.get(host))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

struct HostCallGuard(HostCallLimit);

#[async_trait]
impl Policy for HostCallGuard {
    async fn evaluate(
        &self,
        call: &ToolInvocation,
        context: &mut PolicyContext,
        _result: Option<&Value>,
    ) -> PolicyVerdict {
        let host = match self.0.host(call) {
            Ok(host) => host,
            Err(reason) => return PolicyVerdict::deny(reason),
        };
        let count = self.0.count(context, &host);
        if count >= self.0.max_calls {
            PolicyVerdict::deny(format!(
                "The domain {host} was called too many times: {count}"
            ))
        } else {
            PolicyVerdict::allow()
        }
    }
}

struct HostCallCounter(HostCallLimit);

#[async_trait]
impl Policy for HostCallCounter {
    async fn evaluate(
        &self,
        call: &ToolInvocation,
        context: &mut PolicyContext,
        _result: Option<&Value>,
    ) -> PolicyVerdict {
        let Ok(host) = self.0.host(call) else {
            return PolicyVerdict::allow();
        };
        let key = self.0.context_key();
        let mut counts = match context.remove(&key) {
            Some(Value::Object(counts)) => counts,
            _ => Map::new(),
        };
        let next = counts.get(&host).and_then(Value::as_u64).unwrap_or(0) + 1;
        counts.insert(host, Value::from(next));
        context.set(key, Value::Object(counts));
        PolicyVerdict::allow()
    }
}
