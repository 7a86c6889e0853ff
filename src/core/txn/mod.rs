//! Transaction Manager: buffered multi-operation commits with
//! read-committed + read-your-writes isolation and deadlock-free commit
//! ordering.

mod manager;
mod transaction;

pub use manager::TransactionManager;
pub use transaction::{Operation, Transaction};
