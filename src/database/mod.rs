pub mod connection;
pub mod memory_ledger;
pub mod mongo_ledger;

pub use memory_ledger::InMemoryLedger;
pub use mongo_ledger::MongoLedger;
