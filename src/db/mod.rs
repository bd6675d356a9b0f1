//! The database layer: the engine root, the transaction handle built on top
//! of it, the per-volume directory tree, and backup/restore.

pub mod backup;
pub mod directory;
pub mod engine;
pub mod transaction;

pub use backup::{backup, restore, BackupOptions, RestoreOptions};
pub use engine::Engine;
pub use transaction::{Transaction, TxExchange};
