//! Configuration for agents, synthesis, store adapters and the orchestrator
//!
//! Every struct has working defaults taken from the production deployment
//! (7 document-search calls, 5 graph calls, a 60 second deadline). A
//! configuration can be built in code with [`ConfigBuilder`], read from a TOML
//! file with [`from_file`], or derived from the environment with [`from_env`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AgentsError, Result};
use crate::orchestrator::Route;

/// Stop-early thresholds handed to the decision function as advice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    /// Distinct sources after which further tool calls are discouraged
    pub min_independent_sources: usize,
    /// A single observation at or above this relevance is enough
    pub high_relevance: f64,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            min_independent_sources: 2,
            high_relevance: 0.9,
        }
    }
}

/// Per-agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Name used in logs and reports
    pub name: String,

    /// Hard cap on tool calls per run
    pub max_tool_calls: usize,

    /// Confidence reported for an answer salvaged after budget exhaustion
    pub limit_reached_confidence: f64,

    /// Bound on a single tool invocation
    #[serde(rename = "tool_timeout_ms", with = "opt_millis", skip_serializing_if = "Option::is_none")]
    pub tool_timeout: Option<Duration>,

    pub evidence: EvidenceConfig,
}

impl AgentConfig {
    /// Defaults for the document-search agent.
    pub fn document() -> Self {
        Self {
            name: "document".to_string(),
            max_tool_calls: 7,
            ..Default::default()
        }
    }

    /// Defaults for the graph-query agent.
    pub fn graph() -> Self {
        Self {
            name: "graph".to_string(),
            max_tool_calls: 5,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(config_error("agent name must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.limit_reached_confidence) {
            return Err(config_error(format!(
                "{}: limit_reached_confidence must be within [0, 1]",
                self.name
            )));
        }
        if !(0.0..=1.0).contains(&self.evidence.high_relevance) {
            return Err(config_error(format!(
                "{}: evidence.high_relevance must be within [0, 1]",
                self.name
            )));
        }
        if self.tool_timeout == Some(Duration::ZERO) {
            return Err(config_error(format!(
                "{}: tool_timeout must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "agent".to_string(),
            max_tool_calls: 5,
            limit_reached_confidence: 0.3,
            tool_timeout: None,
            evidence: EvidenceConfig::default(),
        }
    }
}

/// Synthesis of two branch answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Confidence gap at which the combined text flags a disagreement
    pub disagreement_threshold: f64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            disagreement_threshold: 0.5,
        }
    }
}

/// Limits applied by the store tool adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreLimits {
    pub default_num_results: usize,
    pub max_results: usize,
    /// Serialized result size above which graph output is truncated
    pub max_result_chars: usize,
    /// Cap on the rendered graph schema
    pub max_schema_chars: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            default_num_results: 5,
            max_results: 100,
            max_result_chars: 50_000,
            max_schema_chars: 5_000,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub document: AgentConfig,
    pub graph: AgentConfig,
    pub synthesis: SynthesisConfig,
    pub stores: StoreLimits,

    /// Overall deadline for the routed branches
    #[serde(rename = "timeout_secs", with = "secs")]
    pub timeout: Duration,

    /// Route used when routing itself fails
    pub fallback_route: Route,

    /// Questions are cut to this many characters in log fields
    pub question_log_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            document: AgentConfig::document(),
            graph: AgentConfig::graph(),
            synthesis: SynthesisConfig::default(),
            stores: StoreLimits::default(),
            timeout: Duration::from_secs(60),
            fallback_route: Route::DocumentOnly,
            question_log_chars: 100,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        self.document.validate()?;
        self.graph.validate()?;
        if self.timeout.is_zero() {
            return Err(config_error("timeout must be positive"));
        }
        if self.synthesis.disagreement_threshold < 0.0 {
            return Err(config_error("disagreement_threshold must not be negative"));
        }
        if self.stores.max_results == 0 || self.stores.default_num_results > self.stores.max_results
        {
            return Err(config_error(
                "stores.default_num_results must be within 1..=max_results",
            ));
        }
        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> AgentsError {
    AgentsError::Config {
        message: message.into(),
    }
}

// Durations are plain integers in files: `timeout_secs = 60`, `tool_timeout_ms = 500`.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: OrchestratorConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn document_max_tool_calls(mut self, n: usize) -> Self {
        self.config.document.max_tool_calls = n;
        self
    }

    pub fn graph_max_tool_calls(mut self, n: usize) -> Self {
        self.config.graph.max_tool_calls = n;
        self
    }

    pub fn fallback_route(mut self, route: Route) -> Self {
        self.config.fallback_route = route;
        self
    }

    pub fn disagreement_threshold(mut self, threshold: f64) -> Self {
        self.config.synthesis.disagreement_threshold = threshold;
        self
    }

    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.config.document.tool_timeout = Some(timeout);
        self.config.graph.tool_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<OrchestratorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Load configuration from environment variables on top of the defaults.
pub fn from_env() -> Result<OrchestratorConfig> {
    from_lookup(|key| std::env::var(key).ok())
}

/// Same as [`from_env`] with an explicit variable source.
pub fn from_lookup<F>(lookup: F) -> Result<OrchestratorConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = OrchestratorConfig::default();

    if let Some(secs) = lookup("QA_TIMEOUT_SECS") {
        config.timeout = Duration::from_secs(parse_var("QA_TIMEOUT_SECS", &secs)?);
    }
    if let Some(n) = lookup("QA_DOCUMENT_MAX_TOOL_CALLS") {
        config.document.max_tool_calls = parse_var("QA_DOCUMENT_MAX_TOOL_CALLS", &n)?;
    }
    if let Some(n) = lookup("QA_GRAPH_MAX_TOOL_CALLS") {
        config.graph.max_tool_calls = parse_var("QA_GRAPH_MAX_TOOL_CALLS", &n)?;
    }
    if let Some(route) = lookup("QA_FALLBACK_ROUTE") {
        config.fallback_route = route.parse()?;
    }

    config.validate()?;
    Ok(config)
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| config_error(format!("{} has an invalid value: {:?}", key, raw)))
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<OrchestratorConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: OrchestratorConfig = toml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.document.max_tool_calls, 7);
        assert_eq!(config.graph.max_tool_calls, 5);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.fallback_route, Route::DocumentOnly);
        assert_eq!(config.stores.max_result_chars, 50_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .timeout(Duration::from_secs(5))
            .document_max_tool_calls(3)
            .fallback_route(Route::Both)
            .build()
            .unwrap();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.document.max_tool_calls, 3);
        assert_eq!(config.fallback_route, Route::Both);

        let err = ConfigBuilder::new().timeout(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, AgentsError::Config { .. }));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("QA_TIMEOUT_SECS", "15"),
            ("QA_GRAPH_MAX_TOOL_CALLS", "2"),
            ("QA_FALLBACK_ROUTE", "graph_only"),
        ]
        .into_iter()
        .collect();
        let config = from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert_eq!(config.graph.max_tool_calls, 2);
        assert_eq!(config.document.max_tool_calls, 7);
        assert_eq!(config.fallback_route, Route::GraphOnly);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = from_lookup(|k| (k == "QA_TIMEOUT_SECS").then(|| "soon".to_string())).unwrap_err();
        assert!(err.to_string().contains("QA_TIMEOUT_SECS"));
    }

    #[test]
    fn test_from_file_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
fallback_route = "both"
question_log_chars = 40
timeout_secs = 20

[graph]
name = "graph"
max_tool_calls = 9
tool_timeout_ms = 750

[synthesis]
disagreement_threshold = 0.25
"#
        )
        .unwrap();
        let config = from_file(file.path()).unwrap();
        assert_eq!(config.fallback_route, Route::Both);
        assert_eq!(config.graph.max_tool_calls, 9);
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert_eq!(config.graph.tool_timeout, Some(Duration::from_millis(750)));
        assert_eq!(config.graph.limit_reached_confidence, 0.3);
        assert_eq!(config.document, AgentConfig::document());
        assert_eq!(config.synthesis.disagreement_threshold, 0.25);
        assert_eq!(config.question_log_chars, 40);
    }

    #[test]
    fn test_durations_round_trip_as_integers() {
        let config = ConfigBuilder::new()
            .timeout(Duration::from_secs(45))
            .tool_timeout(Duration::from_millis(300))
            .build()
            .unwrap();
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("timeout_secs = 45"));
        assert!(text.contains("tool_timeout_ms = 300"));
        let back: OrchestratorConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_agent_validation() {
        let mut agent = AgentConfig::document();
        agent.limit_reached_confidence = 1.5;
        assert!(agent.validate().is_err());
        agent.limit_reached_confidence = 0.2;
        agent.tool_timeout = Some(Duration::ZERO);
        assert!(agent.validate().is_err());
    }
}
