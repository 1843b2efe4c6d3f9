// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Covers broker, orchestrator, tagging, pacing and producer settings plus per-agent identities
use crate::paths;
use crate::personality::PersonalityProfile;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub tagging: TaggingConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub producer: ProducerSettings,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

// ─── BrokerConfig ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// URL agents use to reach the broker
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Messages whose hop count reaches this are rejected
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            url: default_broker_url(),
            max_hops: default_max_hops(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl BrokerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}

fn default_broker_port() -> u16 {
    8765
}

fn default_broker_url() -> String {
    "http://127.0.0.1:8765".to_string()
}

fn default_max_hops() -> u32 {
    3
}

fn default_heartbeat_timeout_secs() -> u64 {
    300 // 5 minutes
}

fn default_sweep_interval_secs() -> u64 {
    60
}

// ─── OrchestratorConfig ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How often an idle agent considers opening a conversation
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_min_messages")]
    pub min_messages: u32,
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
    #[serde(default = "default_min_response_delay_ms")]
    pub min_response_delay_ms: u64,
    #[serde(default = "default_max_response_delay_ms")]
    pub max_response_delay_ms: u64,
    /// A conversation with no traffic for this long ends regardless of length
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_base_initiation_rate")]
    pub base_initiation_rate: f64,
    #[serde(default = "default_agent_response_probability")]
    pub agent_response_probability: f64,
    #[serde(default = "default_human_response_probability")]
    pub human_response_probability: f64,
    #[serde(default = "default_min_invitees")]
    pub min_invitees: usize,
    #[serde(default = "default_max_invitees")]
    pub max_invitees: usize,
    #[serde(default = "default_invite_delay_min_ms")]
    pub invite_delay_min_ms: u64,
    #[serde(default = "default_invite_delay_max_ms")]
    pub invite_delay_max_ms: u64,
    #[serde(default = "default_true")]
    pub sign_off: bool,
    #[serde(default = "default_sign_off_delay_ms")]
    pub sign_off_delay_ms: u64,
    /// Local hour (0-23) quiet hours begin
    #[serde(default)]
    pub quiet_hours_start: Option<u8>,
    /// Local hour (0-23) quiet hours end, exclusive
    #[serde(default)]
    pub quiet_hours_end: Option<u8>,
    /// Multiplier applied to initiation probability during quiet hours
    #[serde(default = "default_quiet_hours_weight")]
    pub quiet_hours_weight: f64,
    /// IANA timezone used to evaluate quiet hours
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Lowest relevance any topic can score
    #[serde(default = "default_relevance_floor")]
    pub relevance_floor: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            min_messages: default_min_messages(),
            max_messages: default_max_messages(),
            min_response_delay_ms: default_min_response_delay_ms(),
            max_response_delay_ms: default_max_response_delay_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            base_initiation_rate: default_base_initiation_rate(),
            agent_response_probability: default_agent_response_probability(),
            human_response_probability: default_human_response_probability(),
            min_invitees: default_min_invitees(),
            max_invitees: default_max_invitees(),
            invite_delay_min_ms: default_invite_delay_min_ms(),
            invite_delay_max_ms: default_invite_delay_max_ms(),
            sign_off: true,
            sign_off_delay_ms: default_sign_off_delay_ms(),
            quiet_hours_start: None,
            quiet_hours_end: None,
            quiet_hours_weight: default_quiet_hours_weight(),
            timezone: default_timezone(),
            relevance_floor: default_relevance_floor(),
        }
    }
}

impl OrchestratorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_timeout_secs as i64)
    }

    pub fn timezone(&self) -> Result<chrono_tz::Tz> {
        self.timezone.parse::<chrono_tz::Tz>().map_err(|_| {
            anyhow::anyhow!(
                "Invalid timezone '{}'. Use IANA timezone names like 'America/Chicago', 'Europe/London', 'UTC'",
                self.timezone
            )
        })
    }
}

fn default_check_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_min_messages() -> u32 {
    5
}

fn default_max_messages() -> u32 {
    15
}

fn default_min_response_delay_ms() -> u64 {
    1500
}

fn default_max_response_delay_ms() -> u64 {
    6000
}

fn default_idle_timeout_secs() -> u64 {
    900 // 15 minutes
}

fn default_base_initiation_rate() -> f64 {
    0.25
}

fn default_agent_response_probability() -> f64 {
    0.35
}

fn default_human_response_probability() -> f64 {
    0.8
}

fn default_min_invitees() -> usize {
    2
}

fn default_max_invitees() -> usize {
    3
}

fn default_invite_delay_min_ms() -> u64 {
    2000
}

fn default_invite_delay_max_ms() -> u64 {
    15000
}

fn default_sign_off_delay_ms() -> u64 {
    3000
}

fn default_quiet_hours_weight() -> f64 {
    0.2
}

fn default_relevance_floor() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    if let Ok(tz) = std::env::var("TZ") {
        if tz.parse::<chrono_tz::Tz>().is_ok() {
            return tz;
        }
    }
    "UTC".to_string()
}

// ─── TaggingConfig ──────────────────────────────────────────────

/// Selection parameters for one class of subject (agents or humans)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagPolicy {
    #[serde(default = "default_tag_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_relevance_weight")]
    pub relevance_weight: f64,
    /// Upper bound of the uniform noise added to each score
    #[serde(default = "default_tag_jitter")]
    pub jitter: f64,
    /// Recency score halves every this many seconds since last seen
    #[serde(default = "default_recency_half_life_secs")]
    pub recency_half_life_secs: u64,
}

impl Default for TagPolicy {
    fn default() -> Self {
        Self {
            cooldown_secs: default_tag_cooldown_secs(),
            max_tags: default_max_tags(),
            recency_weight: default_recency_weight(),
            relevance_weight: default_relevance_weight(),
            jitter: default_tag_jitter(),
            recency_half_life_secs: default_recency_half_life_secs(),
        }
    }
}

impl TagPolicy {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaggingConfig {
    #[serde(default)]
    pub agents: TagPolicy,
    #[serde(default)]
    pub humans: TagPolicy,
}

fn default_tag_cooldown_secs() -> u64 {
    86_400 // 24 hours
}

fn default_max_tags() -> usize {
    2
}

fn default_recency_weight() -> f64 {
    0.4
}

fn default_relevance_weight() -> f64 {
    0.6
}

fn default_tag_jitter() -> f64 {
    0.1
}

fn default_recency_half_life_secs() -> u64 {
    3600
}

// ─── PacingConfig ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_burst_min_ms")]
    pub burst_min_ms: u64,
    #[serde(default = "default_burst_max_ms")]
    pub burst_max_ms: u64,
    #[serde(default = "default_pause_probability")]
    pub pause_probability: f64,
    #[serde(default = "default_pause_min_ms")]
    pub pause_min_ms: u64,
    #[serde(default = "default_pause_max_ms")]
    pub pause_max_ms: u64,
    /// Relative jitter applied to total typing time, e.g. 0.2 for ±20%
    #[serde(default = "default_pacing_jitter")]
    pub jitter: f64,
    #[serde(default = "default_max_total_ms")]
    pub max_total_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            burst_min_ms: default_burst_min_ms(),
            burst_max_ms: default_burst_max_ms(),
            pause_probability: default_pause_probability(),
            pause_min_ms: default_pause_min_ms(),
            pause_max_ms: default_pause_max_ms(),
            jitter: default_pacing_jitter(),
            max_total_ms: default_max_total_ms(),
        }
    }
}

fn default_burst_min_ms() -> u64 {
    800
}

fn default_burst_max_ms() -> u64 {
    4000
}

fn default_pause_probability() -> f64 {
    0.3
}

fn default_pause_min_ms() -> u64 {
    500
}

fn default_pause_max_ms() -> u64 {
    2500
}

fn default_pacing_jitter() -> f64 {
    0.2
}

fn default_max_total_ms() -> u64 {
    20_000
}

// ─── ProducerSettings ───────────────────────────────────────────

/// Which content producer drafts messages, plus its free-form options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerSettings {
    /// Producer type: "template", "scripted", "command"
    #[serde(rename = "type", default = "default_producer_type")]
    pub producer_type: String,
    #[serde(flatten)]
    pub options: toml::Table,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            producer_type: default_producer_type(),
            options: toml::Table::new(),
        }
    }
}

impl ProducerSettings {
    /// Options as JSON, the form producer factories accept
    pub fn options_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&self.options).context("Failed to convert producer options to JSON")
    }
}

fn default_producer_type() -> String {
    "template".to_string()
}

// ─── AgentConfig ────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub token: String,
    /// Platform chat this agent posts into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub personality: PersonalityProfile,
    /// Topics this agent may open conversations about
    #[serde(default)]
    pub topics: Vec<String>,
    /// Fixed seed for reproducible runs; entropy when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

// Custom Debug impl to redact token
impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("id", &self.id)
            .field("token", &"[REDACTED]")
            .field("chat_id", &self.chat_id)
            .field("topics", &self.topics)
            .field("seed", &self.seed)
            .finish()
    }
}

impl AgentConfig {
    /// Topics to open with; falls back to the personality's interests
    pub fn opening_topics(&self) -> Vec<String> {
        if self.topics.is_empty() {
            self.personality.interests.clone()
        } else {
            self.topics.clone()
        }
    }

    /// Interest vocabulary used when others score relevance for this agent
    pub fn interests(&self) -> Vec<String> {
        let mut interests = self.personality.interests.clone();
        for topic in &self.topics {
            if !interests.contains(topic) {
                interests.push(topic.clone());
            }
        }
        interests
    }
}

fn token_env_var(agent_id: &str) -> String {
    let suffix: String = agent_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("CHORUS_TOKEN_{}", suffix)
}

fn check_probability(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        anyhow::bail!("{} must be within [0, 1], got {}", name, value);
    }
    Ok(())
}

fn check_range<T: PartialOrd + std::fmt::Display>(
    min_name: &str,
    min: T,
    max_name: &str,
    max: T,
) -> Result<()> {
    if min > max {
        anyhow::bail!(
            "{} ({}) must not exceed {} ({})",
            min_name,
            min,
            max_name,
            max
        );
    }
    Ok(())
}

impl Config {
    /// Find the config file, checking multiple locations in order:
    /// 1. CHORUS_CONFIG_PATH env var (if set)
    /// 2. ./config.toml (current directory - for development)
    /// 3. ~/.config/chorus/config.toml (XDG config dir)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("CHORUS_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load configuration with environment variable overrides, then validate
    /// Searches: CHORUS_CONFIG_PATH env var, ./config.toml, then ~/.config/chorus/config.toml
    pub fn load() -> Result<Self> {
        let mut config = if let Some(config_path) = Self::find_config_file() {
            tracing::info!(
                path = %config_path.display(),
                "Loading configuration from file"
            );
            Self::read_file(&config_path)?
        } else {
            tracing::info!("No config file found, using environment variables and defaults");
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a specific file, apply env overrides and validate
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut config = Self::read_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str::<Config>(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Parse and validate a TOML document without consulting the environment
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("CHORUS_BROKER_HOST") {
            self.broker.host = val;
        }
        if let Ok(val) = std::env::var("CHORUS_BROKER_PORT") {
            self.broker.port = val.parse().with_context(|| {
                format!("CHORUS_BROKER_PORT must be a valid port number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("CHORUS_BROKER_URL") {
            self.broker.url = val;
        }
        if let Ok(val) = std::env::var("CHORUS_MAX_HOPS") {
            self.broker.max_hops = val.parse().with_context(|| {
                format!("CHORUS_MAX_HOPS must be a valid number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("CHORUS_TIMEZONE") {
            self.orchestrator.timezone = val;
        }
        for agent in &mut self.agents {
            if let Ok(val) = std::env::var(token_env_var(&agent.id)) {
                agent.token = val;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let broker = &self.broker;
        if broker.max_hops < 1 {
            anyhow::bail!("broker.max_hops must be at least 1");
        }
        if broker.heartbeat_timeout_secs == 0 {
            anyhow::bail!("broker.heartbeat_timeout_secs must be positive");
        }
        if broker.sweep_interval_secs == 0 {
            anyhow::bail!("broker.sweep_interval_secs must be positive");
        }

        let orch = &self.orchestrator;
        orch.timezone()?;
        if orch.min_messages == 0 {
            anyhow::bail!("orchestrator.min_messages must be at least 1");
        }
        check_range(
            "orchestrator.min_messages",
            orch.min_messages,
            "orchestrator.max_messages",
            orch.max_messages,
        )?;
        check_range(
            "orchestrator.min_response_delay_ms",
            orch.min_response_delay_ms,
            "orchestrator.max_response_delay_ms",
            orch.max_response_delay_ms,
        )?;
        check_range(
            "orchestrator.min_invitees",
            orch.min_invitees,
            "orchestrator.max_invitees",
            orch.max_invitees,
        )?;
        check_range(
            "orchestrator.invite_delay_min_ms",
            orch.invite_delay_min_ms,
            "orchestrator.invite_delay_max_ms",
            orch.invite_delay_max_ms,
        )?;
        for (name, value) in [
            ("orchestrator.base_initiation_rate", orch.base_initiation_rate),
            (
                "orchestrator.agent_response_probability",
                orch.agent_response_probability,
            ),
            (
                "orchestrator.human_response_probability",
                orch.human_response_probability,
            ),
            ("orchestrator.quiet_hours_weight", orch.quiet_hours_weight),
            ("orchestrator.relevance_floor", orch.relevance_floor),
        ] {
            check_probability(name, value)?;
        }
        if orch.relevance_floor <= 0.0 {
            anyhow::bail!(
                "orchestrator.relevance_floor must be above 0, got {}",
                orch.relevance_floor
            );
        }
        for (name, hour) in [
            ("orchestrator.quiet_hours_start", orch.quiet_hours_start),
            ("orchestrator.quiet_hours_end", orch.quiet_hours_end),
        ] {
            if let Some(hour) = hour {
                if hour > 23 {
                    anyhow::bail!("{} must be an hour in 0..=23, got {}", name, hour);
                }
            }
        }
        if orch.poll_interval_ms == 0
            || orch.check_interval_secs == 0
            || orch.heartbeat_interval_secs == 0
        {
            anyhow::bail!("orchestrator poll, check and heartbeat intervals must be positive");
        }

        for (label, policy) in [("agents", &self.tagging.agents), ("humans", &self.tagging.humans)] {
            check_probability(&format!("tagging.{}.recency_weight", label), policy.recency_weight)?;
            check_probability(
                &format!("tagging.{}.relevance_weight", label),
                policy.relevance_weight,
            )?;
            if policy.jitter < 0.0 {
                anyhow::bail!("tagging.{}.jitter must not be negative", label);
            }
        }

        let pacing = &self.pacing;
        check_range(
            "pacing.burst_min_ms",
            pacing.burst_min_ms,
            "pacing.burst_max_ms",
            pacing.burst_max_ms,
        )?;
        check_range(
            "pacing.pause_min_ms",
            pacing.pause_min_ms,
            "pacing.pause_max_ms",
            pacing.pause_max_ms,
        )?;
        if pacing.burst_min_ms == 0 {
            anyhow::bail!("pacing.burst_min_ms must be positive");
        }
        check_range(
            "pacing.burst_min_ms",
            pacing.burst_min_ms,
            "pacing.max_total_ms",
            pacing.max_total_ms,
        )?;
        check_probability("pacing.pause_probability", pacing.pause_probability)?;
        check_probability("pacing.jitter", pacing.jitter)?;

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                anyhow::bail!("agents[].id must not be empty");
            }
            if agent.token.trim().is_empty() {
                anyhow::bail!(
                    "agent {} has no token (set in config.toml or {} env var)",
                    agent.id,
                    token_env_var(&agent.id)
                );
            }
            if !seen.insert(agent.id.as_str()) {
                anyhow::bail!("duplicate agent id: {}", agent.id);
            }
            agent
                .personality
                .validate()
                .with_context(|| format!("agent {} has an invalid personality", agent.id))?;
        }

        Ok(())
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    /// Get an agent's config, returning an error if it is not configured
    pub fn agent_config(&self, agent_id: &str) -> Result<&AgentConfig> {
        self.agent(agent_id)
            .ok_or_else(|| anyhow::anyhow!("agent '{}' is not configured", agent_id))
    }

    /// Interests of every configured agent except `agent_id`
    pub fn peer_interests(&self, agent_id: &str) -> Vec<(String, Vec<String>)> {
        self.agents
            .iter()
            .filter(|a| a.id != agent_id)
            .map(|a| (a.id.clone(), a.interests()))
            .collect()
    }
}
