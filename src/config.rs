//! Environment-driven configuration.
//!
//! ## Environment Variables
//!
//! - `SNOWFLAKE_ACCOUNT`, `SNOWFLAKE_USER`, `SNOWFLAKE_PRIVATE_KEY_PATH`: key-pair principal (required)
//! - `CORTEX_SEARCH_SERVICE`, `CORTEX_SEMANTIC_MODEL`: tool resources (required)
//! - `CORTEX_AGENT_ENDPOINT`: defaults to the account's `agent:run` URL
//! - `CORTEX_MODEL`: default `llama3.1-70b`
//! - `CORTEX_SEARCH_TOOL` / `CORTEX_ANALYST_TOOL`: tool names
//! - `CORTEX_SEARCH_MAX_RESULTS`, `CORTEX_SEARCH_TITLE_COLUMN`, `CORTEX_SEARCH_ID_COLUMN`
//! - `SNOWFLAKE_TOKEN_LIFETIME_SECS` / `SNOWFLAKE_TOKEN_RENEWAL_SECS`: default 10800 each
//! - `CORTEX_REQUEST_TIMEOUT_SECS`: default 120
//! - `CORTEX_CITATION_STYLE`: `last` (default) or `every`

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::aggregate::CitationStyle;
use crate::auth::{TokenTimings, DEFAULT_TOKEN_SECS};
use crate::error::ConfigError;

pub const DEFAULT_MODEL: &str = "llama3.1-70b";
pub const DEFAULT_SEARCH_TOOL: &str = "vehicles_info_search";
pub const DEFAULT_ANALYST_TOOL: &str = "supply_chain";
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Cortex Search tool binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchToolConfig {
    pub tool_name: String,
    pub service: String,
    pub max_results: u32,
    pub title_column: String,
    pub id_column: String,
}

/// Cortex Analyst (text-to-SQL) tool binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalystToolConfig {
    pub tool_name: String,
    pub semantic_model_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub account: String,
    pub user: String,
    pub private_key_path: PathBuf,
    pub endpoint: Option<String>,
    pub model: String,
    pub search: SearchToolConfig,
    pub analyst: AnalystToolConfig,
    pub token_timings: TokenTimings,
    pub request_timeout: Duration,
    pub citation_style: CitationStyle,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        Ok(Self {
            account: env.required("SNOWFLAKE_ACCOUNT")?,
            user: env.required("SNOWFLAKE_USER")?,
            private_key_path: PathBuf::from(env.required("SNOWFLAKE_PRIVATE_KEY_PATH")?),
            endpoint: env.optional("CORTEX_AGENT_ENDPOINT"),
            model: env.or("CORTEX_MODEL", DEFAULT_MODEL),
            search: SearchToolConfig {
                tool_name: env.or("CORTEX_SEARCH_TOOL", DEFAULT_SEARCH_TOOL),
                service: env.required("CORTEX_SEARCH_SERVICE")?,
                max_results: env.parsed("CORTEX_SEARCH_MAX_RESULTS", 1)?,
                title_column: env.or("CORTEX_SEARCH_TITLE_COLUMN", "title"),
                id_column: env.or("CORTEX_SEARCH_ID_COLUMN", "relative_path"),
            },
            analyst: AnalystToolConfig {
                tool_name: env.or("CORTEX_ANALYST_TOOL", DEFAULT_ANALYST_TOOL),
                semantic_model_file: env.required("CORTEX_SEMANTIC_MODEL")?,
            },
            token_timings: TokenTimings {
                lifetime: Duration::from_secs(
                    env.parsed("SNOWFLAKE_TOKEN_LIFETIME_SECS", DEFAULT_TOKEN_SECS)?,
                ),
                renewal_delay: Duration::from_secs(
                    env.parsed("SNOWFLAKE_TOKEN_RENEWAL_SECS", DEFAULT_TOKEN_SECS)?,
                ),
            },
            request_timeout: Duration::from_secs(
                env.parsed("CORTEX_REQUEST_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?,
            ),
            citation_style: env.parsed("CORTEX_CITATION_STYLE", CitationStyle::default())?,
        })
    }

    /// Configured endpoint, or the account's `agent:run` URL.
    pub fn endpoint_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!(
                "https://{}.snowflakecomputing.com/api/v2/cortex/agent:run",
                self.account.to_lowercase().replace('_', "-")
            ),
        }
    }
}

/// Session settings for the query-execution collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseConfig {
    pub account: String,
    pub user: String,
    pub password: String,
    pub role: Option<String>,
    pub warehouse: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
}

impl WarehouseConfig {
    /// `Ok(None)` when no `SNOWFLAKE_PASSWORD` is set.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let Some(password) = env.optional("SNOWFLAKE_PASSWORD") else {
            return Ok(None);
        };

        Ok(Some(Self {
            account: env.required("SNOWFLAKE_ACCOUNT")?,
            user: env.required("SNOWFLAKE_USER")?,
            password,
            role: env.optional("SNOWFLAKE_ROLE"),
            warehouse: env.optional("SNOWFLAKE_WAREHOUSE"),
            database: env.optional("SNOWFLAKE_DATABASE"),
            schema: env.optional("SNOWFLAKE_SCHEMA"),
        }))
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("SNOWFLAKE_ACCOUNT", "myorg-myacct"),
            ("SNOWFLAKE_USER", "svc_bot"),
            ("SNOWFLAKE_PRIVATE_KEY_PATH", "/keys/rsa_key.p8"),
            ("CORTEX_SEARCH_SERVICE", "sales_intelligence.data.vehicles_info"),
            ("CORTEX_SEMANTIC_MODEL", "@sales_intelligence.data.models/supply_chain.yaml"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<AgentConfig, ConfigError> {
        AgentConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_fill_optional_settings() {
        let config = load(&base()).unwrap();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.search.tool_name, DEFAULT_SEARCH_TOOL);
        assert_eq!(config.search.max_results, 1);
        assert_eq!(config.search.id_column, "relative_path");
        assert_eq!(config.analyst.tool_name, DEFAULT_ANALYST_TOOL);
        assert_eq!(config.token_timings, TokenTimings::default());
        assert_eq!(config.request_timeout, Duration::from_secs(120));
        assert_eq!(config.citation_style, CitationStyle::LastSource);
        assert_eq!(
            config.endpoint_url(),
            "https://myorg-myacct.snowflakecomputing.com/api/v2/cortex/agent:run"
        );
    }

    #[test]
    fn missing_required_value_is_reported() {
        let mut vars = base();
        vars.remove("CORTEX_SEMANTIC_MODEL");
        assert!(matches!(load(&vars), Err(ConfigError::Missing("CORTEX_SEMANTIC_MODEL"))));

        let mut vars = base();
        vars.insert("SNOWFLAKE_USER", "  ");
        assert!(matches!(load(&vars), Err(ConfigError::Missing("SNOWFLAKE_USER"))));
    }

    #[test]
    fn timings_are_independent() {
        let mut vars = base();
        vars.insert("SNOWFLAKE_TOKEN_LIFETIME_SECS", "3600");
        vars.insert("SNOWFLAKE_TOKEN_RENEWAL_SECS", "600");
        let config = load(&vars).unwrap();
        assert_eq!(config.token_timings.lifetime, Duration::from_secs(3600));
        assert_eq!(config.token_timings.renewal_delay, Duration::from_secs(600));
    }

    #[test]
    fn unparsable_number_is_an_error() {
        let mut vars = base();
        vars.insert("CORTEX_SEARCH_MAX_RESULTS", "many");
        match load(&vars) {
            Err(ConfigError::Invalid { key, value, .. }) => {
                assert_eq!(key, "CORTEX_SEARCH_MAX_RESULTS");
                assert_eq!(value, "many");
            }
            other => panic!("expected invalid value, got {:?}", other),
        }
    }

    #[test]
    fn explicit_endpoint_and_style_win() {
        let mut vars = base();
        vars.insert("CORTEX_AGENT_ENDPOINT", "http://127.0.0.1:9000/api/v2/cortex/agent:run");
        vars.insert("CORTEX_CITATION_STYLE", "every");
        let config = load(&vars).unwrap();
        assert_eq!(config.endpoint_url(), "http://127.0.0.1:9000/api/v2/cortex/agent:run");
        assert_eq!(config.citation_style, CitationStyle::EverySource);
    }

    #[test]
    fn warehouse_is_optional() {
        let vars = base();
        let lookup = |key: &str| vars.get(key).map(|v| v.to_string());
        assert_eq!(WarehouseConfig::from_lookup(lookup).unwrap(), None);

        let mut vars = base();
        vars.insert("SNOWFLAKE_PASSWORD", "hunter2");
        vars.insert("SNOWFLAKE_WAREHOUSE", "COMPUTE_WH");
        let config = WarehouseConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(config.warehouse.as_deref(), Some("COMPUTE_WH"));
        assert_eq!(config.role, None);
    }
}
