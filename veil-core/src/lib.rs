pub mod block;
pub mod blockstore;
pub mod chain;
pub mod chain_manager;
pub mod chainstate;
pub mod compstore;
pub mod computation;
pub mod expr;
pub mod fhe;
pub mod fork;
pub mod mempool;
pub mod merkle;
pub mod miner;
pub mod transaction;
pub mod wallet;

// Re-exports principais
pub use block::{Block, BlockHeader};
pub use blockstore::BlockStore;
pub use chain::{Chain, ChainParams, GenesisParams};
pub use chain_manager::ChainManager;
pub use chainstate::{Chainstate, UtxoRecord};
pub use compstore::CompStore;
pub use computation::{Computation, ComputationFactory, ComputationRegistry, SharedComputation};
pub use fhe::{DevBackend, FheBackend, FheComputation, FheFactory, FHE_WIRE_TAG};
pub use fork::Fork;
pub use mempool::MemPool;
pub use miner::Miner;
pub use transaction::{Transaction, TransactionInput, TransactionOutput};
pub use wallet::Wallet;

// Re-exports de tipos compartilhados
pub use shared::{CoreError, Hash256, Result};
