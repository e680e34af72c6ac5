//! Coinbase (generation) transaction, split around the extraNonce placeholder

use crate::{
    config::StratumConfig,
    error::Result,
    template::BlockTemplateRpc,
    utils::{reversed, serialize_number, uint256_from_hash, var_int},
};

const COINBASE_PAYLOAD_TX_TYPE: u32 = 5;

/// Merged-mining commitment embedded in the coinbase script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuxCommitment {
    pub root: [u8; 32],
    pub size: u32,
}

/// The coinbase transaction bytes before and after the extraNonce space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Generation {
    pub prefix: Vec<u8>,
    pub suffix: Vec<u8>,
}

fn output(value: u64, script: &[u8]) -> Vec<u8> {
    let mut buf = value.to_le_bytes().to_vec();
    buf.extend(var_int(script.len() as u64));
    buf.extend_from_slice(script);
    buf
}

/// Builds both coinbase halves. The miner-controlled extraNonce of
/// `placeholder_len` bytes goes between `prefix` and `suffix`.
pub fn build_generation(
    config: &StratumConfig,
    rpc: &BlockTemplateRpc,
    placeholder_len: usize,
    aux: Option<&AuxCommitment>,
    timestamp: u64,
) -> Result<Generation> {
    let extra_payload = rpc.coinbase_payload.as_deref().map(hex::decode).transpose()?;
    let version: u32 = if extra_payload.is_some() { 3 + (COINBASE_PAYLOAD_TX_TYPE << 16) } else { 1 };

    let flags = match rpc.coinbaseaux.as_ref().map(|aux| aux.flags.as_str()) {
        Some(flags) if !flags.is_empty() => hex::decode(flags)?,
        _ => vec![],
    };

    let mut script_sig = serialize_number(rpc.height);
    script_sig.extend(flags);
    script_sig.extend(serialize_number(timestamp));
    script_sig.push(placeholder_len as u8);
    if let (Some(commitment), Some(auxiliary)) = (aux, config.auxiliary.as_ref().filter(|a| a.enabled)) {
        script_sig.extend(hex::decode(&auxiliary.header)?);
        script_sig.extend(reversed(&commitment.root));
        script_sig.extend(commitment.size.to_le_bytes());
        script_sig.extend(0u32.to_le_bytes());
    }

    let mut prefix = version.to_le_bytes().to_vec();
    prefix.extend(var_int(1));
    prefix.extend(uint256_from_hash("")?);
    prefix.extend(u32::MAX.to_le_bytes());
    prefix.extend(var_int((script_sig.len() + placeholder_len) as u64));
    prefix.extend(script_sig);

    let mut reward = rpc.coinbasevalue;
    let mut outputs = Vec::new();
    if let Some(commitment) = &rpc.default_witness_commitment {
        outputs.push(output(0, &hex::decode(commitment)?));
    }
    let mut recipients = Vec::with_capacity(config.primary.recipients.len());
    for recipient in &config.primary.recipients {
        let amount = (recipient.percentage * rpc.coinbasevalue as f64).floor() as u64;
        reward = reward.saturating_sub(amount);
        recipients.push(output(amount, &hex::decode(&recipient.script)?));
    }
    outputs.push(output(reward, &hex::decode(&config.primary.script)?));
    outputs.extend(recipients);

    let mut suffix = 0u32.to_le_bytes().to_vec();
    suffix.extend(var_int(outputs.len() as u64));
    outputs.into_iter().for_each(|o| suffix.extend(o));
    suffix.extend(0u32.to_le_bytes());
    if let Some(payload) = extra_payload {
        suffix.extend(var_int(payload.len() as u64));
        suffix.extend(payload);
    }

    Ok(Generation { prefix, suffix })
}
