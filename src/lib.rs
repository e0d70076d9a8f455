pub mod batch;
pub mod blockfile;
pub mod bpool;
pub mod config;
pub mod data;
pub mod db;
pub mod error;
pub mod filter;
pub mod flock;
pub mod freelist;
pub mod hasher;
pub mod header;
pub mod index;
pub mod items;
pub mod memtable;
pub mod message;
pub mod metrics;
mod sync;
mod tasks;
pub mod tmpfs;
pub mod wal;
pub mod window;

pub use batch::{Batch, BatchGroup, BatchOptions};
pub use config::{LogPoolOptions, Options};
pub use db::Db;
pub use error::{Error, Result};
pub use items::{Item, ItemIterator, Query};
pub use message::{Entry, Id, Topic};
