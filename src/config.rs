//! Configuration management for the Conduit relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::model::{Capability, LedgerModel};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub sponsorship: SponsorshipConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub quorum: QuorumConfig,
    #[serde(default)]
    pub validators: Vec<ValidatorConfig>,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    #[serde(default = "default_max_concurrent_intents")]
    pub max_concurrent_intents: usize,
    #[serde(default = "default_intake_buffer")]
    pub intake_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_interval_secs: u64,
    pub probe_timeout_ms: u64,
    /// Number of recent calls the error rate is computed over.
    pub window_size: usize,
    /// Chains scoring below this are excluded from routing.
    pub score_floor: f64,
    pub registration_failure_threshold: u32,
    pub registration_window_ms: u64,
    pub drain_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 30,
            probe_timeout_ms: 5_000,
            window_size: 20,
            score_floor: 0.3,
            registration_failure_threshold: 3,
            registration_window_ms: 10_000,
            drain_timeout_secs: 60,
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn registration_window(&self) -> Duration {
        Duration::from_millis(self.registration_window_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Relative weights of the router's scoring terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingWeights {
    pub sponsorship: f64,
    pub latency: f64,
    pub cost: f64,
    pub reliability: f64,
    pub preference: f64,
}

impl Default for RoutingWeights {
    fn default() -> Self {
        Self {
            sponsorship: 0.2,
            latency: 0.2,
            cost: 0.25,
            reliability: 0.25,
            preference: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub weights: RoutingWeights,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SponsorshipConfig {
    /// Daily limit per tier, in normalized cost units.
    pub tiers: BTreeMap<String, u64>,
    pub treasury_balance: u64,
    pub min_reserve: u64,
    pub reset_check_secs: u64,
}

impl Default for SponsorshipConfig {
    fn default() -> Self {
        let mut tiers = BTreeMap::new();
        tiers.insert("basic".to_string(), 1_000);
        tiers.insert("premium".to_string(), 10_000);
        Self {
            tiers,
            treasury_balance: 1_000_000,
            min_reserve: 10_000,
            reset_check_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Timeout of a single adapter call.
    pub call_timeout_secs: u64,
    pub quorum_timeout_secs: u64,
    /// Hard cap on an in-flight transfer before refund becomes mandatory.
    pub lifecycle_cap_secs: u64,
    /// Locked transfers older than this are swept into the refund path.
    pub refund_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            quorum_timeout_secs: 60,
            lifecycle_cap_secs: 300,
            refund_timeout_secs: 3_600,
            sweep_interval_secs: 30,
        }
    }
}

impl BridgeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn quorum_timeout(&self) -> Duration {
        Duration::from_secs(self.quorum_timeout_secs)
    }

    pub fn lifecycle_cap(&self) -> Duration {
        Duration::from_secs(self.lifecycle_cap_secs)
    }

    pub fn refund_timeout(&self) -> Duration {
        Duration::from_secs(self.refund_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

/// Threshold applied to transfers up to `max_amount` (unbounded when absent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskTierConfig {
    pub name: String,
    pub max_amount: Option<u64>,
    pub threshold: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    pub default_threshold: usize,
    pub risk_tiers: Vec<RiskTierConfig>,
    /// Cumulative amount a validator attests to per period before it treats
    /// further requests as anomalous.
    pub anomaly_threshold: u64,
    pub anomaly_period_secs: u64,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            default_threshold: 2,
            risk_tiers: Vec::new(),
            anomaly_threshold: 10_000_000,
            anomaly_period_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    pub name: String,
    /// Hex-encoded secp256k1 key, usually injected as `${VALIDATOR_KEY}`.
    pub private_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    #[serde(default = "default_base_fee")]
    pub base_fee: u64,
    #[serde(default)]
    pub priority_fee: u64,
    #[serde(default = "default_max_fee")]
    pub max_fee: u64,
    /// Per-block drift of the base fee in basis points (variable-fee ledgers).
    #[serde(default)]
    pub drift_bps: u32,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            base_fee: default_base_fee(),
            priority_fee: 0,
            max_fee: default_max_fee(),
            drift_bps: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: String,
    pub name: String,
    pub model: LedgerModel,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_confirmation_latency_ms")]
    pub confirmation_latency_ms: u64,
    #[serde(default)]
    pub fee: FeeConfig,
    /// Native fee units per normalized cost unit.
    #[serde(default = "default_cost_normalization")]
    pub cost_normalization: u64,
    /// Funds the operator uses to pay sponsored fees on this chain.
    #[serde(default)]
    pub operator_float: u64,
    /// Overrides the adapter's declared capability set.
    #[serde(default)]
    pub capabilities: Option<Vec<Capability>>,
    /// Opening balances, keyed by holder.
    #[serde(default)]
    pub genesis: BTreeMap<String, u64>,
}

impl ChainConfig {
    /// Chain with default fees and no opening balances.
    pub fn new(chain_id: impl Into<String>, model: LedgerModel) -> Self {
        let chain_id = chain_id.into();
        Self {
            name: chain_id.clone(),
            chain_id,
            model,
            enabled: true,
            confirmation_latency_ms: default_confirmation_latency_ms(),
            fee: FeeConfig::default(),
            cost_normalization: default_cost_normalization(),
            operator_float: 0,
            capabilities: None,
            genesis: BTreeMap::new(),
        }
    }

    pub fn with_genesis(mut self, holder: impl Into<String>, amount: u64) -> Self {
        self.genesis.insert(holder.into(), amount);
        self
    }

    pub fn confirmation_latency(&self) -> Duration {
        Duration::from_millis(self.confirmation_latency_ms)
    }
}

fn default_max_concurrent_intents() -> usize {
    64
}

fn default_intake_buffer() -> usize {
    1_024
}

fn default_true() -> bool {
    true
}

fn default_confirmation_latency_ms() -> u64 {
    400
}

fn default_base_fee() -> u64 {
    1_000
}

fn default_max_fee() -> u64 {
    u64::MAX
}

fn default_cost_normalization() -> u64 {
    1
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("CONDUIT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));
        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text, substituting `${VAR}` references
    pub fn parse(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        let mut seen = std::collections::HashSet::new();
        for (name, chain) in &self.chains {
            if !seen.insert(chain.chain_id.as_str()) {
                anyhow::bail!("Chain id {} is configured more than once", chain.chain_id);
            }
            if chain.cost_normalization == 0 {
                anyhow::bail!("Chain {} has a zero cost normalization factor", name);
            }
            if chain.fee.max_fee < chain.fee.base_fee {
                anyhow::bail!("Chain {} max_fee is below its base_fee", name);
            }
        }

        if !(0.0..=1.0).contains(&self.health.score_floor) {
            anyhow::bail!("health.score_floor must be within [0, 1]");
        }
        if self.health.registration_failure_threshold == 0 {
            anyhow::bail!("health.registration_failure_threshold must be positive");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be positive");
        }

        if self.quorum.default_threshold == 0 {
            anyhow::bail!("quorum.default_threshold must be positive");
        }
        for tier in &self.quorum.risk_tiers {
            if tier.threshold == 0 {
                anyhow::bail!("Risk tier {} has a zero threshold", tier.name);
            }
        }
        let max_threshold = self
            .quorum
            .risk_tiers
            .iter()
            .map(|t| t.threshold)
            .chain(std::iter::once(self.quorum.default_threshold))
            .max()
            .unwrap_or(0);
        if !self.validators.is_empty() && max_threshold > self.validators.len() {
            tracing::warn!(
                "Quorum threshold {} exceeds the {} configured validators",
                max_threshold,
                self.validators.len()
            );
        }

        if self.sponsorship.tiers.is_empty() {
            tracing::warn!("No sponsorship tiers configured - every request will pay its own way");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        let mut chains: Vec<_> = self.chains.iter().filter(|(_, c)| c.enabled).collect();
        chains.sort_by(|a, b| a.1.chain_id.cmp(&b.1.chain_id));
        chains
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: &str) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static pattern");
    }

    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [relayer]
        instance_id = "test"

        [api]
        host = "127.0.0.1"
        port = 8080

        [metrics]
        enabled = false
        port = 9090

        [chains.object]
        chain_id = "object-1"
        name = "Object ledger"
        model = "object_owned"

        [chains.evm]
        chain_id = "evm-1"
        name = "EVM ledger"
        model = "variable_fee_account"
        fee = { base_fee = 20, max_fee = 400, drift_bps = 1250 }
        genesis = { alice = 5000 }
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("CONDUIT_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${CONDUIT_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn defaults_follow_documented_values() {
        let settings = Settings::parse(MINIMAL).unwrap();
        assert_eq!(settings.health.probe_interval_secs, 30);
        assert_eq!(settings.health.window_size, 20);
        assert_eq!(settings.health.score_floor, 0.3);
        assert_eq!(settings.health.registration_failure_threshold, 3);
        assert_eq!(settings.retry.base_delay_ms, 500);
        assert_eq!(settings.retry.max_delay_ms, 30_000);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.quorum.default_threshold, 2);
        assert_eq!(settings.bridge.refund_timeout_secs, 3_600);
        assert_eq!(settings.bridge.lifecycle_cap_secs, 300);
        assert_eq!(settings.bridge.call_timeout_secs, 30);
        assert!(settings.database.is_none());

        let evm = settings.get_chain_by_id("evm-1").unwrap();
        assert_eq!(evm.model, LedgerModel::VariableFeeAccount);
        assert_eq!(evm.fee.drift_bps, 1250);
        assert_eq!(evm.genesis.get("alice"), Some(&5000));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let settings = Settings::load_from(file.path()).unwrap();
        let ids: Vec<_> = settings
            .enabled_chains()
            .into_iter()
            .map(|(_, c)| c.chain_id.clone())
            .collect();
        assert_eq!(ids, vec!["evm-1".to_string(), "object-1".to_string()]);
    }

    #[test]
    fn shipped_config_parses() {
        let settings = Settings::parse(include_str!("../config/default.toml")).unwrap();
        assert_eq!(settings.enabled_chains().len(), 3);
        assert_eq!(settings.validators.len(), 3);
        assert_eq!(settings.quorum.risk_tiers.len(), 2);
        assert_eq!(settings.sponsorship.tiers.get("basic"), Some(&1_000));
        assert!(settings.get_chain_by_id("object-1").is_some());
    }

    #[test]
    fn rejects_duplicate_chain_ids() {
        let dup = format!(
            "{}\n[chains.again]\nchain_id = \"evm-1\"\nname = \"dup\"\nmodel = \"fast_finality_account\"\n",
            MINIMAL
        );
        assert!(Settings::parse(&dup).is_err());
    }
}
