use crate::{
    algorithms::Algorithm,
    error::{Error, Result},
};
use serde::Deserialize;
use std::path::PathBuf;

/// Pool-side configuration of the stratum server.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StratumConfig {
    pub ports: Vec<PortConfig>,
    pub banning: BanningConfig,
    pub settings: Settings,
    pub coin: CoinConfig,
    pub primary: PrimaryConfig,
    #[serde(default)]
    pub auxiliary: Option<AuxiliaryConfig>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    pub port: u16,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub tls: bool,
    pub difficulty: DifficultyConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DifficultyConfig {
    /// Difficulty pushed with the first job, before any retarget
    #[serde(default)]
    pub initial: f64,
    pub minimum: f64,
    pub maximum: f64,
    /// Desired seconds between shares
    pub target_time: f64,
    /// Seconds between retarget evaluations
    pub retarget_time: f64,
    pub variance: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BanningConfig {
    /// Ban duration in seconds
    pub time: u64,
    pub invalid_percent: f64,
    pub check_threshold: u64,
    /// Seconds between ban table sweeps
    pub purge_interval: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Seconds without a submitted share before a miner is dropped
    pub connection_timeout: u64,
    /// Seconds without a new template before a broadcast timeout is reported
    pub job_rebroadcast_timeout: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoinConfig {
    pub algorithms: AlgorithmsConfig,
    #[serde(default)]
    pub asicboost: bool,
    /// Hybrid chains append a trailing zero byte to serialized blocks
    #[serde(default)]
    pub hybrid: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct AlgorithmsConfig {
    pub mining: Algorithm,
    pub block: Algorithm,
    pub coinbase: Algorithm,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryConfig {
    /// Pool payout output script, hex encoded
    pub script: String,
    #[serde(default)]
    pub recipients: Vec<RecipientConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RecipientConfig {
    pub script: String,
    pub percentage: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AuxiliaryConfig {
    pub enabled: bool,
    /// Merged-mining magic header, hex encoded
    #[serde(default)]
    pub header: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub server_key: PathBuf,
    pub server_cert: PathBuf,
}

fn enabled_by_default() -> bool {
    true
}

impl StratumConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.ports.iter().any(|p| p.enabled) {
            return Err(Error::Config("at least one port must be enabled".into()));
        }
        if self.ports.iter().any(|p| p.enabled && p.tls) && self.tls.is_none() {
            return Err(Error::Config("TLS ports require server key and certificate".into()));
        }
        for port in &self.ports {
            port.difficulty.validate().map_err(|msg| Error::Config(format!("port {}: {}", port.port, msg)))?;
        }
        if self.banning.check_threshold == 0 {
            return Err(Error::Config("banning.checkThreshold must be positive".into()));
        }
        hex::decode(&self.primary.script)?;
        let mut total = 0.0;
        for recipient in &self.primary.recipients {
            hex::decode(&recipient.script)?;
            total += recipient.percentage;
        }
        if !(0.0..1.0).contains(&total) {
            return Err(Error::Config("recipient percentages must sum to less than 1".into()));
        }
        Ok(())
    }

    pub fn merged_mining(&self) -> bool {
        self.auxiliary.as_ref().is_some_and(|aux| aux.enabled)
    }
}

impl DifficultyConfig {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.target_time <= 0.0 || self.retarget_time <= 0.0 {
            return Err("targetTime and retargetTime must be positive".into());
        }
        if !(0.0..1.0).contains(&self.variance) {
            return Err("variance must be within [0, 1)".into());
        }
        if self.minimum > self.maximum {
            return Err("minimum difficulty exceeds maximum".into());
        }
        Ok(())
    }
}
