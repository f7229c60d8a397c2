use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;

use super::{block_cid, Error, IpldStore};

/// In-process block store. Backs tests and local development; production
/// deployments point the pipeline at a networked store instead.
#[derive(Debug, Default)]
pub struct MemoryIpldStore {
    blocks: RwLock<HashMap<Cid, Bytes>>,
}

impl MemoryIpldStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.blocks
            .read()
            .expect("store lock poisoned")
            .contains_key(cid)
    }
}

#[async_trait]
impl IpldStore for MemoryIpldStore {
    async fn put_block(&self, data: &[u8], codec: u64) -> Result<Cid, Error> {
        let cid = block_cid(data, codec);
        self.blocks
            .write()
            .expect("store lock poisoned")
            .insert(cid, Bytes::copy_from_slice(data));
        Ok(cid)
    }

    async fn get_block(&self, cid: &Cid) -> Result<Vec<u8>, Error> {
        self.blocks
            .read()
            .expect("store lock poisoned")
            .get(cid)
            .map(|bytes| bytes.to_vec())
            .ok_or(Error::NotFound { cid: *cid })
    }
}

#[cfg(test)]
mod tests {
    use super::super::DAG_CBOR;
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = MemoryIpldStore::new();
        let cid = store.put_block(b"hello", DAG_CBOR).await.unwrap();
        assert_eq!(store.get_block(&cid).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn puts_are_idempotent() {
        let store = MemoryIpldStore::new();
        let a = store.put_block(b"same", DAG_CBOR).await.unwrap();
        let b = store.put_block(b"same", DAG_CBOR).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn missing_block_is_not_found() {
        let store = MemoryIpldStore::new();
        let cid = block_cid(b"absent", DAG_CBOR);
        assert!(matches!(
            store.get_block(&cid).await,
            Err(Error::NotFound { .. })
        ));
    }
}
