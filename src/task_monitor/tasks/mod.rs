pub mod anchor;
pub mod evict_metadata;
pub mod expire_requests;
pub mod monitor_queue;
