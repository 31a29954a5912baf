//! Rate limit rules and the rules file.
//!
//! Rules are attached to handlers in code or loaded from a YAML file that
//! maps full method paths to rule lists:
//!
//! ```yaml
//! methods:
//!   /helloworld.Greeter/SayHello:
//!     - max_calls: 100
//!       time_period: 60
//!       keys: ["metadata:x-api-key"]
//!     - max_calls: 1000
//!       time_period: 60
//!       group: greeter
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU64;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::fingerprint::KeySpec;
use crate::error::{Result, TollgateError};

/// One admission policy: at most `max_calls` per `time_period` seconds
/// for each distinct fingerprint.
pub struct RateLimitRule<Req> {
    max_calls: u64,
    time_period: NonZeroU64,
    group: Option<String>,
    keys: Vec<KeySpec<Req>>,
}

impl<Req> RateLimitRule<Req> {
    /// Create a rule. A zero `time_period` is a configuration error.
    pub fn new(max_calls: u64, time_period: u64) -> Result<Self> {
        let time_period = NonZeroU64::new(time_period).ok_or_else(|| {
            TollgateError::Config("time_period must be greater than 0".to_string())
        })?;

        Ok(Self {
            max_calls,
            time_period,
            group: None,
            keys: Vec::new(),
        })
    }

    /// Count this rule in a named group instead of per handler.
    ///
    /// Rules with the same group share one counter across handlers.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Add a key specification; keys are resolved in insertion order.
    pub fn key(mut self, key: KeySpec<Req>) -> Self {
        self.keys.push(key);
        self
    }

    /// Add a key in its string form, e.g. `metadata:user-agent`.
    pub fn key_str(self, key: &str) -> Result<Self> {
        Ok(self.key(KeySpec::parse(key)?))
    }

    /// Calls admitted per window.
    pub fn max_calls(&self) -> u64 {
        self.max_calls
    }

    /// Window length in seconds.
    pub fn time_period(&self) -> NonZeroU64 {
        self.time_period
    }

    /// Shared group name, if the rule sets one.
    pub fn group_name(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Key specs that split the limit, in order.
    pub fn keys(&self) -> &[KeySpec<Req>] {
        &self.keys
    }
}

impl<Req> Clone for RateLimitRule<Req> {
    fn clone(&self) -> Self {
        Self {
            max_calls: self.max_calls,
            time_period: self.time_period,
            group: self.group.clone(),
            keys: self.keys.clone(),
        }
    }
}

impl<Req> fmt::Debug for RateLimitRule<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitRule")
            .field("max_calls", &self.max_calls)
            .field("time_period", &self.time_period)
            .field("group", &self.group)
            .field("keys", &self.keys)
            .finish()
    }
}

/// A rule as written in the rules file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Maximum calls per window
    pub max_calls: u64,
    /// Window length in seconds
    pub time_period: u64,
    /// Optional shared counter group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Key specifications in string form
    #[serde(default)]
    pub keys: Vec<String>,
}

impl RuleConfig {
    /// Convert into a typed rule, validating the period and every key.
    pub fn to_rule<Req>(&self) -> Result<RateLimitRule<Req>> {
        let mut rule = RateLimitRule::new(self.max_calls, self.time_period)?;
        if let Some(group) = &self.group {
            rule = rule.group(group.clone());
        }
        for key in &self.keys {
            rule = rule.key_str(key)?;
        }
        Ok(rule)
    }
}

/// Rules for every configured method, keyed by full method path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub methods: BTreeMap<String, Vec<RuleConfig>>,
}

impl RateLimitConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateLimitConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every rule, reporting the first invalid one with its method.
    pub fn validate(&self) -> Result<()> {
        for (method, rules) in &self.methods {
            for (index, rule) in rules.iter().enumerate() {
                rule.to_rule::<()>().map_err(|e| {
                    TollgateError::Config(format!("{} rule #{}: {}", method, index + 1, e))
                })?;
            }
        }
        Ok(())
    }

    /// Typed rules for a method, in file order. Unknown methods have none.
    pub fn rules_for<Req>(&self, method: &str) -> Result<Vec<RateLimitRule<Req>>> {
        self.methods
            .get(method)
            .map(|rules| rules.iter().map(|rule| rule.to_rule::<Req>()).collect())
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}
