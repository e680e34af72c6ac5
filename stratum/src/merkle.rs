use crate::utils::sha256d;

pub type Hash = [u8; 32];

fn merkle_join(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256d(&buf)
}

/// Merkle branch of the coinbase position over a block's transaction hashes.
///
/// The coinbase hash is unknown while building jobs, so the tree keeps only
/// the sibling hashes (`steps`) needed to fold any coinbase hash into the root.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MerkleTree {
    steps: Vec<Hash>,
}

impl MerkleTree {
    /// `hashes` are the non-coinbase transaction hashes in internal byte order.
    pub fn new(hashes: &[Hash]) -> Self {
        let mut level = Vec::with_capacity(hashes.len() + 1);
        // position 0 is the coinbase, never read
        level.push([0u8; 32]);
        level.extend_from_slice(hashes);

        let mut steps = Vec::new();
        while level.len() > 1 {
            steps.push(level[1]);
            if level.len() % 2 == 1 {
                let last = level[level.len() - 1];
                level.push(last);
            }
            let mut next = Vec::with_capacity(level.len() / 2);
            next.push([0u8; 32]);
            next.extend(level[2..].chunks_exact(2).map(|pair| merkle_join(&pair[0], &pair[1])));
            level = next;
        }
        Self { steps }
    }

    pub fn steps(&self) -> &[Hash] {
        &self.steps
    }

    pub fn steps_hex(&self) -> Vec<String> {
        self.steps.iter().map(hex::encode).collect()
    }

    /// Root of the tree whose first leaf is `first`.
    pub fn with_first(&self, first: Hash) -> Hash {
        self.steps.iter().fold(first, |acc, step| merkle_join(&acc, step))
    }
}
