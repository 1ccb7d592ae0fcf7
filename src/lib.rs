#![deny(missing_docs)]
//! # rendez
//! A rendezvous key-value store: the meeting point a distributed job's
//! worker processes use to discover each other and trade small coordination
//! blobs (ranks, endpoints, barrier counters).
//!
//! One participant runs the store daemon, a single-threaded TCP event loop
//! that owns the key-value map; every participant, the server process
//! included, talks to it as a [`Store`] client over a framed binary
//! protocol. Beyond plain reads and writes the store offers the two
//! primitives rendezvous is built from: [`wait`], which blocks until a set
//! of keys all have values, and [`watch_key`], which has the daemon push a
//! notification to the client every time a key changes.
//!
//! ```no_run
//! use rendez::{Store, StoreConfig};
//! # fn main() -> rendez::Result<()> {
//! // worker process: the server at 10.0.0.1 runs the daemon
//! let mut store = Store::connect(StoreConfig::new("10.0.0.1", 29500).num_workers(4))?;
//! let rank = store.add("rank-counter", 1)? - 1;
//! store.set(&format!("endpoint/{}", rank), b"10.0.0.7:41000")?;
//! # Ok(())
//! # }
//! ```
//!
//! [`Store`]: ./struct.Store.html
//! [`wait`]: ./struct.Store.html#method.wait
//! [`watch_key`]: ./struct.Store.html#method.watch_key

mod client;
mod daemon;
mod error;
mod frame;
mod listener;
mod protocol;

pub use self::client::{Store, StoreConfig};
pub use self::daemon::Daemon;
pub use self::error::{Result, StoreError};
pub use self::listener::WatchCallback;
