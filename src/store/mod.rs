//! External persistence integration

pub mod ledger;

pub use ledger::LedgerClient;
