//! WIREDKV - Segment-based Key-Value Storage Engine
//!
//! An embedded storage engine that keeps named **segments**, each holding
//! tables of key/value entities in one append-only file.
//!
//! ## Features
//! - **Record Codec**: Length-prefixed records with CRC32 integrity checks
//! - **Encryption Envelope**: Optional AES-256-GCM at-rest encryption
//! - **Offset Index**: In-memory map of live records, rebuilt by rescanning
//! - **Crash Recovery**: Torn tails are detected and cut at open time
//! - **Concurrency**: Per-segment write locks, lock-light snapshot reads
//! - **Metrics**: Lock-free atomic counters for observability
//!
//! ## Example
//! ```no_run
//! use wiredkv::config::Config;
//! use wiredkv::engine::SegmentStore;
//! use wiredkv::types::{Entity, Table, Tables};
//!
//! let store = SegmentStore::open(Config::default()).unwrap();
//!
//! let tables = Tables::new()
//!     .with_table(Table::new("cart").with_entity(Entity::new("user-01", "3 items")));
//! let segment = store.new_segment("orders", tables, 0).unwrap();
//! store.put_segment("orders", &segment).unwrap();
//!
//! let fetched = store.fetch_segment("orders").unwrap();
//! assert_eq!(fetched.tables().table("cart").unwrap().get(b"user-01").unwrap().value, b"3 items");
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod types;
