use crate::{
    error::{Error, Result},
    utils::sha256d,
};
use num_bigint::BigUint;
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

const SHA256D_DIFF1: &str = "00000000ffff0000000000000000000000000000000000000000000000000000";
const KAWPOW_DIFF1: &str = "00000000ff000000000000000000000000000000000000000000000000000000";
const FIROPOW_DIFF1: &str = "00000000ffff0000000000000000000000000000000000000000000000000000";

/// Proof-of-work algorithms known to the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Sha256d,
    Kawpow,
    Firopow,
}

/// Job and header layout shared by a group of algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    /// Bitcoin-style jobs: coinbase halves plus merkle branch
    Default,
    /// Kawpow/Firopow jobs: header hash plus epoch seed
    ProgPow,
}

impl Family {
    /// Bytes of extraNonce1 handed out per connection.
    pub fn extranonce1_size(self) -> usize {
        match self {
            Family::Default => 4,
            Family::ProgPow => 2,
        }
    }

    /// Total extraNonce bytes reserved in the coinbase script.
    pub fn extranonce_space(self) -> usize {
        match self {
            Family::Default => 8,
            Family::ProgPow => 2,
        }
    }

    pub fn extranonce2_size(self) -> usize {
        self.extranonce_space() - self.extranonce1_size()
    }
}

impl Algorithm {
    pub fn family(self) -> Family {
        match self {
            Algorithm::Sha256d => Family::Default,
            Algorithm::Kawpow | Algorithm::Firopow => Family::ProgPow,
        }
    }

    fn diff1_hex(self) -> &'static str {
        match self {
            Algorithm::Sha256d => SHA256D_DIFF1,
            Algorithm::Kawpow => KAWPOW_DIFF1,
            Algorithm::Firopow => FIROPOW_DIFF1,
        }
    }

    /// Target corresponding to difficulty 1.
    pub fn max_difficulty(self) -> BigUint {
        // constants are valid hex
        BigUint::parse_bytes(self.diff1_hex().as_bytes(), 16).unwrap_or_default()
    }

    pub fn max_difficulty_f64(self) -> f64 {
        self.max_difficulty().to_f64().unwrap_or(f64::MAX)
    }

    /// Blocks per DAG epoch for ProgPow-family algorithms.
    pub fn epoch_length(self) -> Option<u64> {
        match self {
            Algorithm::Sha256d => None,
            Algorithm::Kawpow => Some(7500),
            Algorithm::Firopow => Some(1300),
        }
    }

    /// Share target for `difficulty` as a zero-padded 64 character hex string.
    pub fn target_hex(self, difficulty: f64) -> String {
        let target = BigUint::from_f64(self.max_difficulty_f64() / difficulty)
            .unwrap_or_else(|| (BigUint::from(1u8) << 256u32) - 1u8);
        let mut hex = format!("{:064x}", target);
        hex.truncate(64);
        hex
    }

    pub fn hash(self, data: &[u8]) -> Result<[u8; 32]> {
        match self {
            Algorithm::Sha256d => Ok(sha256d(data)),
            other => Err(Error::UnsupportedHash(other.to_string())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::Sha256d => "sha256d",
            Algorithm::Kawpow => "kawpow",
            Algorithm::Firopow => "firopow",
        };
        f.write_str(name)
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256d" => Ok(Algorithm::Sha256d),
            "kawpow" => Ok(Algorithm::Kawpow),
            "firopow" => Ok(Algorithm::Firopow),
            other => Err(Error::UnknownAlgorithm(other.to_string())),
        }
    }
}
