pub mod clock;
pub mod coordinator;
pub mod documents;
pub mod keys;
pub mod lease_timing;
pub mod pipeline;
pub mod retry;
pub mod settings;
pub mod storage;
pub mod trace;
pub mod work_item;
pub mod work_item_store;
pub mod worker;

pub use shardlease_macros::test;
