use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use tracing::info;

use super::{BlockchainClient, Error, TxReceipt};

/// Deterministic in-process chain for local development and tests.
///
/// "Mines" one block per submission; the transaction hash is derived from the
/// submitted root so repeated submissions of the same root are recognizable.
#[derive(Debug)]
pub struct DevBlockchain {
    chain_id: String,
    height: AtomicU64,
}

impl DevBlockchain {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            height: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl BlockchainClient for DevBlockchain {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    async fn send_transaction(&self, root: Cid) -> Result<TxReceipt, Error> {
        let digest = Code::Sha2_256.digest(&root.to_bytes());
        let tx_hash = digest.digest().iter().fold(
            String::with_capacity(66),
            |mut acc, byte| {
                if acc.is_empty() {
                    acc.push_str("0x");
                }
                let _ = write!(acc, "{byte:02x}");
                acc
            },
        );

        let block_number = self.height.fetch_add(1, Ordering::SeqCst) + 1;
        let receipt = TxReceipt {
            tx_hash,
            chain_id: self.chain_id.clone(),
            block_number,
            block_timestamp: Utc::now().timestamp(),
        };

        info!(%root, tx = %receipt.tx_hash, block = block_number, "anchored root on dev chain");
        Ok(receipt)
    }
}
