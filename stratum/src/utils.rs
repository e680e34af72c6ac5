//! Byte-level helpers for coinbase, header and block serialization

use crate::error::{Error, Result};
use num_bigint::BigUint;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Bitcoin compact-size integer.
pub fn var_int(n: u64) -> Vec<u8> {
    match n {
        0..0xfd => vec![n as u8],
        0xfd..=0xffff => {
            let mut buf = vec![0xfd];
            buf.extend_from_slice(&(n as u16).to_le_bytes());
            buf
        }
        0x1_0000..=0xffff_ffff => {
            let mut buf = vec![0xfe];
            buf.extend_from_slice(&(n as u32).to_le_bytes());
            buf
        }
        _ => {
            let mut buf = vec![0xff];
            buf.extend_from_slice(&n.to_le_bytes());
            buf
        }
    }
}

/// Script-number push as used for the BIP34 height and coinbase timestamp.
pub fn serialize_number(n: u64) -> Vec<u8> {
    if (1..=16).contains(&n) {
        return vec![0x50 + n as u8];
    }
    let mut body = Vec::with_capacity(8);
    let mut rest = n;
    while rest > 0x7f {
        body.push((rest & 0xff) as u8);
        rest >>= 8;
    }
    body.push(rest as u8);
    let mut buf = Vec::with_capacity(body.len() + 1);
    buf.push(body.len() as u8);
    buf.extend(body);
    buf
}

pub fn reversed(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().rev().copied().collect()
}

/// Reverses the order of the 4-byte words of a hash, keeping each word intact.
pub fn reverse_word_order(bytes: &[u8]) -> Vec<u8> {
    bytes.chunks(4).rev().flatten().copied().collect()
}

/// Internal byte order of a hash given in display (big-endian) hex.
pub fn uint256_from_hash(hash: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hash)?;
    if bytes.len() > 32 {
        return Err(Error::Template(format!("hash longer than 32 bytes: {}", hash)));
    }
    let mut buf = [0u8; 32];
    for (slot, byte) in buf.iter_mut().zip(bytes.iter().rev()) {
        *slot = *byte;
    }
    Ok(buf)
}

/// Expands compact `bits` into the full target.
pub fn bits_to_target(bits: &str) -> Result<BigUint> {
    let raw = hex::decode(bits)?;
    let Ok([exponent, m0, m1, m2]) = <[u8; 4]>::try_from(raw.as_slice()) else {
        return Err(Error::Template(format!("bits must be 4 bytes: {}", bits)));
    };
    let mantissa = BigUint::from_bytes_be(&[m0, m1, m2]);
    Ok(if exponent >= 3 { mantissa << (8 * (exponent as u32 - 3)) } else { mantissa >> (8 * (3 - exponent as u32)) })
}

/// Issues subscription ids: a fixed marker followed by a little-endian counter.
#[derive(Debug, Default)]
pub struct SubscriptionCounter {
    count: AtomicU64,
}

const SUBSCRIPTION_MARKER: &str = "deadbeefcafebabe";

impl SubscriptionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> String {
        let count = self.count.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        format!("{}{}", SUBSCRIPTION_MARKER, hex::encode(count.to_le_bytes()))
    }
}

/// Fixed-width extraNonce1 source. Starts at a random value and wraps within `size` bytes.
#[derive(Debug)]
pub struct ExtraNonceCounter {
    size: usize,
    next: AtomicU64,
}

impl ExtraNonceCounter {
    pub fn new(size: usize) -> Self {
        let size = size.clamp(1, 8);
        Self { size, next: AtomicU64::new(rand::thread_rng().r#gen()) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn next(&self) -> String {
        let value = self.next.fetch_add(1, Ordering::Relaxed);
        let bytes = value.to_be_bytes();
        hex::encode(&bytes[8 - self.size..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_int() {
        assert_eq!(var_int(1), vec![0x01]);
        assert_eq!(var_int(0xfc), vec![0xfc]);
        assert_eq!(var_int(0xfd), vec![0xfd, 0xfd, 0x00]);
        assert_eq!(var_int(0x1_0000), vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(var_int(0x1_0000_0000), vec![0xff, 0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_serialize_number() {
        assert_eq!(serialize_number(1), vec![0x51]);
        assert_eq!(serialize_number(16), vec![0x60]);
        assert_eq!(serialize_number(0x7f), vec![0x01, 0x7f]);
        assert_eq!(serialize_number(0x80), vec![0x02, 0x80, 0x00]);
        assert_eq!(serialize_number(500_000), vec![0x03, 0x20, 0xa1, 0x07]);
        assert_eq!(serialize_number(1_614_201_893), vec![0x04, 0x25, 0xc4, 0x36, 0x60]);
    }

    #[test]
    fn test_byte_order_helpers() {
        let words = (0u8..8).collect::<Vec<_>>();
        assert_eq!(reverse_word_order(&words), vec![4, 5, 6, 7, 0, 1, 2, 3]);
        assert_eq!(reversed(&[1, 2, 3]), vec![3, 2, 1]);

        let hash = uint256_from_hash("0102").unwrap();
        assert_eq!(&hash[..3], &[0x02, 0x01, 0x00]);
        assert_eq!(uint256_from_hash("").unwrap(), [0u8; 32]);
    }

    #[test]
    fn test_bits_to_target() {
        let target = bits_to_target("1e0ffff0").unwrap();
        assert_eq!(format!("{:064x}", target), "00000ffff0000000000000000000000000000000000000000000000000000000");
        let target = bits_to_target("1d00ffff").unwrap();
        assert_eq!(format!("{:064x}", target), "00000000ffff0000000000000000000000000000000000000000000000000000");
        assert!(bits_to_target("1d00ff").is_err());
    }

    #[test]
    fn test_subscription_ids() {
        let counter = SubscriptionCounter::new();
        assert_eq!(counter.next(), "deadbeefcafebabe0100000000000000");
        assert_eq!(counter.next(), "deadbeefcafebabe0200000000000000");
    }

    #[test]
    fn test_extra_nonces() {
        let counter = ExtraNonceCounter::new(4);
        let first = counter.next();
        let second = counter.next();
        assert_eq!(first.len(), 8);
        assert_ne!(first, second);
        assert_eq!(ExtraNonceCounter::new(2).next().len(), 4);
    }
}
