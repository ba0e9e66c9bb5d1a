pub mod batcher;
pub mod gateway;
pub mod keys;

pub use batcher::{WriteBehindBatcher, WriteOp};
pub use gateway::StoreGateway;
