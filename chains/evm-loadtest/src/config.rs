use anyhow::Result;
use config::{Config, File, FileFormat};
use core_logic::{AdmissionConfig, ConfigError};
use ethers::types::{Address, U256};
use serde::{Deserialize, Deserializer};
use std::path::{Component, Path, PathBuf};
use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::utils::gas::GasLimits;

/// Top-level file layout: one entry per endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct LoadTestConfig {
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    pub http: String,

    #[serde(default)]
    pub private_keys: Vec<PrivateKey>,
    #[serde(default)]
    pub batch_funder_address: Option<Address>,
    #[serde(default)]
    pub num_wallets: usize,
    #[serde(default, deserialize_with = "deserialize_wei")]
    pub fund_amount: U256,
    #[serde(default)]
    pub wallets: Vec<PrivateKey>,

    #[serde(default)]
    pub target_addresses: Vec<Address>,
    #[serde(default)]
    pub num_target_addresses: usize,

    #[serde(default)]
    pub erc20: bool,
    #[serde(default)]
    pub erc20_address: Option<Address>,
    #[serde(default, deserialize_with = "deserialize_wei")]
    pub erc20_mint_amount: U256,

    #[serde(default)]
    pub erc721: bool,
    #[serde(default)]
    pub erc721_address: Option<Address>,
    #[serde(default)]
    pub erc721_mint: bool,

    /// Submissions per second; 0 disables admission control.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: f64,
    #[serde(default)]
    pub adaptive_rate_limit: bool,
    #[serde(default)]
    pub adaptive: AdaptiveSettings,

    #[serde(default, deserialize_with = "deserialize_wei")]
    pub min_gas_price: U256,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub record_dry_run_latency: bool,

    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default)]
    pub gas_limits: GasLimits,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdaptiveSettings {
    #[serde(default = "default_steady_backlog")]
    pub steady_backlog: u64,
    #[serde(default = "default_increment")]
    pub increment: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            steady_backlog: default_steady_backlog(),
            increment: default_increment(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

const MAX_TOKEN_WALLETS: usize = 1000;

fn default_rate_limit() -> f64 {
    4.0
}

fn default_steady_backlog() -> u64 {
    1000
}

fn default_increment() -> f64 {
    50.0
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".scratch/load_test.db")
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("contracts/out")
}

/// Hex private key read from config. Wiped on drop, never printed.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl PrivateKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(***)")
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WeiRepr {
    Int(u64),
    Str(String),
}

/// Accepts an integer or a decimal / 0x-hex string so 1e18-sized amounts
/// survive TOML's i64 integers.
fn deserialize_wei<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    match WeiRepr::deserialize(deserializer)? {
        WeiRepr::Int(v) => Ok(U256::from(v)),
        WeiRepr::Str(s) => parse_wei(&s).map_err(serde::de::Error::custom),
    }
}

pub fn parse_wei(raw: &str) -> Result<U256, String> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x") {
        U256::from_str_radix(hex, 16).map_err(|e| format!("invalid hex amount '{}': {}", raw, e))
    } else {
        U256::from_dec_str(raw).map_err(|e| format!("invalid amount '{}': {}", raw, e))
    }
}

impl LoadTestConfig {
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_string(),
            }
            .into());
        }

        let settings = Config::builder()
            .add_source(File::with_name(path))
            .build()?;

        let cfg: LoadTestConfig = settings.try_deserialize().map_err(|e| anyhow::anyhow!(e))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_str(content: &str, format: FileFormat) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(content, format))
            .build()?;

        let cfg: LoadTestConfig = settings.try_deserialize().map_err(|e| anyhow::anyhow!(e))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::MissingField {
                field: "endpoints".to_string(),
            });
        }
        for endpoint in &self.endpoints {
            endpoint.validate()?;
        }
        Ok(())
    }
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.http).map_err(|_| ConfigError::InvalidRpcUrl {
            url: self.http.clone(),
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidScheme {
                scheme: url.scheme().to_string(),
            });
        }

        if self.num_wallets > 0 && self.private_keys.is_empty() {
            return invalid(
                "private_keys",
                "at least one sponsor key is required to fund generated wallets",
            );
        }
        if self.num_wallets > 0 && self.fund_amount.is_zero() {
            return invalid("fund_amount", "must be positive when num_wallets > 0");
        }

        let wallet_count = self.wallet_count();
        if wallet_count > 0 && self.target_addresses.is_empty() && self.num_target_addresses == 0
        {
            return invalid(
                "target_addresses",
                "either target_addresses or num_target_addresses must be set",
            );
        }

        if self.erc20 {
            if self.erc20_address.is_none() && self.private_keys.is_empty() {
                return invalid("private_keys", "required to deploy the ERC20 contract");
            }
            if wallet_count == 0 && !self.erc20_mint_amount.is_zero() {
                return invalid("erc20_mint_amount", "there are no wallets to mint for");
            }
            if wallet_count > 0 && self.erc20_mint_amount.is_zero() {
                return invalid("erc20_mint_amount", "must be positive when erc20 is enabled");
            }
            if wallet_count > MAX_TOKEN_WALLETS {
                return invalid("num_wallets", "erc20 supports at most 1000 wallets");
            }
        }
        if self.erc721 {
            if self.erc721_address.is_none() && self.private_keys.is_empty() {
                return invalid("private_keys", "required to deploy the ERC721 contract");
            }
            if wallet_count > MAX_TOKEN_WALLETS {
                return invalid("num_wallets", "erc721 supports at most 1000 wallets");
            }
        }
        if self.erc721_mint && wallet_count == 0 {
            return invalid("erc721_mint", "there are no wallets to mint for");
        }

        if self.rate_limit < 0.0 || !self.rate_limit.is_finite() {
            return invalid("rate_limit", "must be a finite, non-negative number");
        }
        if self.adaptive_rate_limit && self.rate_limit == 0.0 {
            return invalid("adaptive_rate_limit", "requires a positive rate_limit");
        }
        if self.adaptive.backoff_factor <= 1.0 {
            return invalid("adaptive.backoff_factor", "must be greater than 1");
        }
        if self.adaptive.increment <= 0.0 {
            return invalid("adaptive.increment", "must be positive");
        }

        let db_path = self.db_path.to_string_lossy();
        if db_path.is_empty() {
            return invalid("db_path", "must not be empty");
        }
        let is_db_file = self.db_path.extension().and_then(|e| e.to_str()) == Some("db");
        if !is_clean_path(&self.db_path) && !is_db_file {
            return invalid("db_path", "must be a normalized path or a .db file");
        }

        Ok(())
    }

    /// Generated plus configured test wallets.
    pub fn wallet_count(&self) -> usize {
        self.num_wallets + self.wallets.len()
    }

    pub fn admission_config(&self) -> Option<AdmissionConfig> {
        if self.rate_limit == 0.0 {
            return None;
        }
        Some(AdmissionConfig {
            initial_rate: self.rate_limit,
            steady_state_backlog: self.adaptive.steady_backlog,
            increment: self.adaptive.increment,
            backoff_factor: self.adaptive.backoff_factor,
            ..AdmissionConfig::default()
        })
    }

    /// Endpoint URL with any user info masked, used as the client tag.
    pub fn sanitized_url(&self) -> String {
        sanitize_url(&self.http)
    }
}

fn invalid(field: &str, reason: &str) -> Result<(), ConfigError> {
    Err(ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    })
}

pub fn sanitize_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if !url.username().is_empty() || url.password().is_some() {
                let _ = url.set_username("***");
                let _ = url.set_password(None);
            }
            url.to_string()
        }
        Err(_) => raw.to_string(),
    }
}

fn is_clean_path(path: &Path) -> bool {
    let raw = path.to_string_lossy();
    if raw.contains("//") || raw.ends_with('/') {
        return false;
    }
    let mut seen_normal = false;
    for component in path.components() {
        match component {
            Component::CurDir => return false,
            Component::ParentDir if seen_normal => return false,
            Component::Normal(_) => seen_normal = true,
            _ => {}
        }
    }
    true
}
