//! An embeddable transactional key/value storage engine.
//!
//! A [`db::Engine`] owns one or more [`volume::Volume`] files, each holding a
//! bootstrap directory [`tree::Tree`] that maps names to the trees an
//! application actually stores data in. Every mutation is journaled to a
//! write-ahead log ([`journal`]) before it reaches a volume's buffer pool
//! frame ([`buffer`]), and concurrent access is arbitrated through MVCC
//! ([`mvcc`]): readers see a snapshot fixed at their transaction's start
//! timestamp, writers take a wwLock per key and leave anti-values behind on
//! delete rather than removing entries in place.
//!
//! The typical embedding:
//!
//! ```no_run
//! use heartwood::config::EngineConfig;
//! use heartwood::db::Engine;
//! use heartwood::btree::{Key, Segment};
//!
//! let engine = Engine::open(EngineConfig::production())?;
//! let volume = engine.volume_ids()[0];
//! let txn = engine.begin(volume)?;
//! let exchange = txn.exchange("accounts", true)?;
//! exchange.store(Key::encode(&[Segment::Str("alice".into())]), b"100".to_vec())?;
//! txn.commit()?;
//! # Ok::<(), heartwood::error::Error>(())
//! ```

pub mod admin;
pub mod btree;
pub mod buffer;
pub mod checksum;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod error;
pub mod journal;
pub mod logging;
pub mod mvcc;
pub mod tree;
pub mod types;
pub mod volume;

pub use config::EngineConfig;
pub use db::{Engine, Transaction, TxExchange};
pub use error::{Error, Result};

impl Engine {
    /// Starts a transaction scoped to `volume`. Shorthand for
    /// [`db::Transaction::begin`], which stays crate-private so every caller
    /// goes through the `Arc<Engine>` entry point.
    pub fn begin(self: &std::sync::Arc<Self>, volume: types::VolumeId) -> Result<Transaction> {
        Transaction::begin(self.clone(), volume)
    }
}
