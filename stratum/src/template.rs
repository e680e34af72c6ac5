//! Block template to job conversion and block candidate assembly

use crate::{
    algorithms::{Algorithm, Family},
    config::StratumConfig,
    error::{Error, Result},
    generation::{AuxCommitment, Generation, build_generation},
    merkle::{Hash, MerkleTree},
    utils::{ExtraNonceCounter, bits_to_target, reverse_word_order, reversed, sha256d, uint256_from_hash, var_int},
};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use parking_lot::Mutex;
use pool_core::time::unix_now_secs;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha3::{Digest, Keccak256};
use std::collections::HashSet;

/// `getblocktemplate` result fields consumed by the pool.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BlockTemplateRpc {
    pub version: u32,
    pub previousblockhash: String,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
    #[serde(default)]
    pub coinbaseaux: Option<CoinbaseAux>,
    pub coinbasevalue: u64,
    #[serde(default)]
    pub target: Option<String>,
    pub curtime: u32,
    pub bits: String,
    pub height: u64,
    #[serde(default)]
    pub default_witness_commitment: Option<String>,
    #[serde(default)]
    pub coinbase_payload: Option<String>,
    #[serde(default)]
    pub votes: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TemplateTransaction {
    pub data: String,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CoinbaseAux {
    #[serde(default)]
    pub flags: String,
}

/// Nonce and mix hash found by a ProgPow miner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgPowSolution {
    pub nonce: Vec<u8>,
    pub mix_hash: Vec<u8>,
}

#[derive(Clone, Copy, Debug)]
enum JobShape {
    Default,
    ProgPow { algorithm: Algorithm, epoch_length: u64 },
}

/// One block template, immutable once built. Shared by every connection
/// that receives jobs from it.
pub struct Template {
    job_id: String,
    rpc: BlockTemplateRpc,
    shape: JobShape,
    block_hasher: Algorithm,
    coinbase_hasher: Algorithm,
    hybrid: bool,
    target: BigUint,
    difficulty: f64,
    merkle: MerkleTree,
    generation: Generation,
    previous_hash: String,
    transactions: Vec<u8>,
    submissions: Mutex<HashSet<String>>,
}

impl Template {
    pub fn new(config: &StratumConfig, rpc: BlockTemplateRpc, job_id: String) -> Result<Self> {
        Self::build(config, rpc, job_id, None, unix_now_secs())
    }

    /// Builds a template; `timestamp` (seconds) goes into the coinbase script.
    pub fn build(
        config: &StratumConfig,
        rpc: BlockTemplateRpc,
        job_id: String,
        aux: Option<&AuxCommitment>,
        timestamp: u64,
    ) -> Result<Self> {
        if rpc.coinbase_payload.is_some() && config.merged_mining() {
            return Err(Error::MergedMiningPayload);
        }

        let algorithms = config.coin.algorithms;
        let mining = algorithms.mining;
        let shape = match (mining.family(), mining.epoch_length()) {
            (Family::ProgPow, Some(epoch_length)) => JobShape::ProgPow { algorithm: mining, epoch_length },
            _ => JobShape::Default,
        };

        let target = match &rpc.target {
            Some(target) => BigUint::parse_bytes(target.as_bytes(), 16)
                .ok_or_else(|| Error::Template(format!("invalid target: {}", target)))?,
            None => bits_to_target(&rpc.bits)?,
        };
        let difficulty = match target.to_f64() {
            Some(t) if t > 0.0 => ((mining.max_difficulty_f64() / t) * 1e9).round() / 1e9,
            _ => return Err(Error::Template("target must be positive".into())),
        };

        let hashes = rpc
            .transactions
            .iter()
            .map(|tx| uint256_from_hash(tx.txid.as_deref().or(tx.hash.as_deref()).unwrap_or_default()))
            .collect::<Result<Vec<_>>>()?;
        let merkle = MerkleTree::new(&hashes);
        let generation = build_generation(config, &rpc, mining.family().extranonce_space(), aux, timestamp)?;
        let previous_hash = hex::encode(reverse_word_order(&hex::decode(&rpc.previousblockhash)?));
        let transactions = rpc.transactions.iter().map(|tx| hex::decode(&tx.data)).collect::<std::result::Result<Vec<_>, _>>()?.concat();

        Ok(Self {
            job_id,
            rpc,
            shape,
            block_hasher: algorithms.block,
            coinbase_hasher: algorithms.coinbase,
            hybrid: config.coin.hybrid,
            target,
            difficulty,
            merkle,
            generation,
            previous_hash,
            transactions,
            submissions: Mutex::new(HashSet::new()),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn rpc(&self) -> &BlockTemplateRpc {
        &self.rpc
    }

    pub fn target(&self) -> &BigUint {
        &self.target
    }

    pub fn difficulty(&self) -> f64 {
        self.difficulty
    }

    pub fn merkle(&self) -> &MerkleTree {
        &self.merkle
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    /// 80-byte header. `ntime` and `nonce` are big-endian hex as sent by
    /// miners; ProgPow headers carry the height in the nonce slot instead.
    pub fn serialize_header(&self, merkle_root: &Hash, ntime: &str, nonce: &str, version: u32) -> Result<Vec<u8>> {
        let mut header = Vec::with_capacity(80);
        header.extend(version.to_le_bytes());
        header.extend(uint256_from_hash(&self.rpc.previousblockhash)?);
        header.extend_from_slice(merkle_root);
        header.extend(word_le(ntime)?);
        header.extend(word_le(&self.rpc.bits)?);
        match self.shape {
            JobShape::Default => header.extend(word_le(nonce)?),
            JobShape::ProgPow { .. } => header.extend((self.rpc.height as u32).to_le_bytes()),
        }
        Ok(header)
    }

    pub fn serialize_coinbase(&self, extra_nonce1: &[u8], extra_nonce2: &[u8]) -> Vec<u8> {
        let mut coinbase = self.generation.prefix.clone();
        coinbase.extend_from_slice(extra_nonce1);
        if let JobShape::Default = self.shape {
            coinbase.extend_from_slice(extra_nonce2);
        }
        coinbase.extend_from_slice(&self.generation.suffix);
        coinbase
    }

    pub fn hash_coinbase(&self, coinbase: &[u8]) -> Result<Hash> {
        self.coinbase_hasher.hash(coinbase)
    }

    /// Block hash in display byte order.
    pub fn hash_block(&self, header: &[u8]) -> Result<Hash> {
        let mut hash = self.block_hasher.hash(header)?;
        hash.reverse();
        Ok(hash)
    }

    pub fn serialize_block(&self, header: &[u8], coinbase: &[u8], solution: Option<&ProgPowSolution>) -> Result<Vec<u8>> {
        let mut block = header.to_vec();
        if let JobShape::ProgPow { .. } = self.shape {
            let solution = solution.ok_or_else(|| Error::Template("ProgPow blocks need a nonce and mix hash".into()))?;
            block.extend_from_slice(&solution.nonce);
            block.extend(reversed(&solution.mix_hash));
        }
        block.extend(var_int(self.rpc.transactions.len() as u64 + 1));
        block.extend_from_slice(coinbase);
        block.extend_from_slice(&self.transactions);
        if let JobShape::Default = self.shape {
            if let Some(votes) = &self.rpc.votes {
                block.extend(var_int(votes.len() as u64));
                for vote in votes {
                    block.extend(hex::decode(vote)?);
                }
            }
            if self.hybrid {
                block.push(0);
            }
        }
        Ok(block)
    }

    /// Records a submission; `false` if the same parts were already seen by this template.
    pub fn register_submission(&self, parts: &[&str]) -> bool {
        let submission = parts.concat().to_lowercase();
        self.submissions.lock().insert(submission)
    }

    /// `mining.notify` parameters for one connection. ProgPow jobs assign
    /// `extra_nonce1` from `counter` when the connection has none yet.
    pub fn job_parameters(&self, extra_nonce1: &mut Option<String>, counter: &ExtraNonceCounter, clean_jobs: bool) -> Result<Vec<Value>> {
        match self.shape {
            JobShape::Default => Ok(vec![
                json!(self.job_id),
                json!(self.previous_hash),
                json!(hex::encode(&self.generation.prefix)),
                json!(hex::encode(&self.generation.suffix)),
                json!(self.merkle.steps_hex()),
                json!(hex::encode(self.rpc.version.to_be_bytes())),
                json!(self.rpc.bits),
                json!(hex::encode(self.rpc.curtime.to_be_bytes())),
                json!(clean_jobs),
            ]),
            JobShape::ProgPow { algorithm, epoch_length } => {
                let extra_nonce1 = extra_nonce1.get_or_insert_with(|| counter.next());
                let coinbase = self.serialize_coinbase(&hex::decode(extra_nonce1.as_str())?, &[]);
                let merkle_root = self.merkle.with_first(self.hash_coinbase(&coinbase)?);
                let ntime = hex::encode(self.rpc.curtime.to_be_bytes());
                let header = self.serialize_header(&merkle_root, &ntime, "", self.rpc.version)?;
                let header_hash = reversed(&sha256d(&header));

                Ok(vec![
                    json!(self.job_id),
                    json!(hex::encode(header_hash)),
                    json!(hex::encode(seed_hash(self.rpc.height / epoch_length))),
                    json!(algorithm.target_hex(self.difficulty)),
                    json!(clean_jobs),
                    json!(self.rpc.height),
                    json!(self.rpc.bits),
                ])
            }
        }
    }
}

/// Little-endian bytes of a 4-byte big-endian hex word.
fn word_le(word: &str) -> Result<[u8; 4]> {
    let bytes = hex::decode(word)?;
    let mut buf: [u8; 4] = bytes.as_slice().try_into().map_err(|_| Error::Template(format!("expected 4 byte word: {}", word)))?;
    buf.reverse();
    Ok(buf)
}

/// ProgPow epoch seed: keccak-256 applied `epoch` times to 32 zero bytes.
pub fn seed_hash(epoch: u64) -> Hash {
    (0..epoch).fold([0u8; 32], |seed, _| Keccak256::digest(seed).into())
}
