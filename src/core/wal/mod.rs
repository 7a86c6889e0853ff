//! Write-Ahead Log: ordered, fsynced, replay-on-start durability.

mod log;
mod record;

pub use log::Wal;
pub use record::WalRecord;
