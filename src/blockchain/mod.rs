//! Blockchain submission capability.
//!
//! The pipeline needs exactly one thing from a chain: publish a Merkle root
//! and learn where it landed. Everything else (wallets, gas, relayers) lives
//! behind [`BlockchainClient`].

use std::time::Duration;

use async_trait::async_trait;
use cid::Cid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub mod dev;

pub use dev::DevBlockchain;

#[derive(Debug, Error)]
pub enum Error {
    /// Worth retrying: nonce races, provider hiccups, mempool congestion.
    #[error("transient blockchain failure: {0}")]
    Transient(anyhow::Error),

    /// Not worth retrying: the batch must abort.
    #[error("fatal blockchain failure: {0}")]
    Fatal(anyhow::Error),
}

/// Where an anchor root landed on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: String,
    /// CAIP-2 chain identifier, e.g. `eip155:1`.
    pub chain_id: String,
    pub block_number: u64,
    pub block_timestamp: i64,
}

#[async_trait]
pub trait BlockchainClient: Send + Sync {
    /// CAIP-2 identifier of the chain this client submits to.
    fn chain_id(&self) -> &str;

    async fn send_transaction(&self, root: Cid) -> Result<TxReceipt, Error>;
}

/// Submits `root`, retrying transient failures with capped exponential
/// backoff. Fatal failures and retry exhaustion surface to the caller.
pub async fn submit_with_retry(
    client: &dyn BlockchainClient,
    root: Cid,
    max_attempts: u32,
    backoff: Duration,
) -> Result<TxReceipt, Error> {
    const BACKOFF_CAP: Duration = Duration::from_secs(60);

    let mut attempt = 0;
    loop {
        match client.send_transaction(root).await {
            Ok(receipt) => return Ok(receipt),
            Err(Error::Transient(e)) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(Error::Transient(e));
                }
                let delay = backoff
                    .checked_mul(1 << (attempt - 1).min(16))
                    .unwrap_or(BACKOFF_CAP)
                    .min(BACKOFF_CAP);
                warn!(
                    %root,
                    attempt,
                    ?delay,
                    error = ?e,
                    "transient failure submitting anchor root, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(fatal) => return Err(fatal),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use multihash_codetable::{Code, MultihashDigest};

    use super::*;

    struct FlakyChain {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl BlockchainClient for FlakyChain {
        fn chain_id(&self) -> &str {
            "eip155:1337"
        }

        async fn send_transaction(&self, _root: Cid) -> Result<TxReceipt, Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures.load(Ordering::SeqCst) {
                return Err(Error::Transient(anyhow::anyhow!("provider timeout")));
            }
            Ok(TxReceipt {
                tx_hash: "0xabc".into(),
                chain_id: "eip155:1337".into(),
                block_number: 1,
                block_timestamp: 1_700_000_000,
            })
        }
    }

    fn root() -> Cid {
        Cid::new_v1(0x71, Code::Sha2_256.digest(b"root"))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let chain = FlakyChain {
            failures: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        };
        let receipt = submit_with_retry(&chain, root(), 5, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(receipt.block_number, 1);
        assert_eq!(chain.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let chain = FlakyChain {
            failures: AtomicU32::new(u32::MAX),
            calls: AtomicU32::new(0),
        };
        let err = submit_with_retry(&chain, root(), 3, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
        assert_eq!(chain.calls.load(Ordering::SeqCst), 3);
    }

    struct FatalChain;

    #[async_trait]
    impl BlockchainClient for FatalChain {
        fn chain_id(&self) -> &str {
            "eip155:1337"
        }

        async fn send_transaction(&self, _root: Cid) -> Result<TxReceipt, Error> {
            Err(Error::Fatal(anyhow::anyhow!("chain id mismatch")))
        }
    }

    #[tokio::test]
    async fn fatal_failures_do_not_retry() {
        let err = submit_with_retry(&FatalChain, root(), 5, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }
}
