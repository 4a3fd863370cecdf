//! # Database-backed State Server
//!
//! This library implements the DBSS node of a message-routed distributed
//! object cluster. The DBSS owns a contiguous range of object ids, loads each
//! object's persistent fields from the database server the first time the
//! object is referenced, keeps it in memory while it is in use, and tells
//! interested observers where it is.
//!
//! ## Core Responsibilities
//!
//! ### Lazy Loading
//! Objects are never preloaded. The first request naming an object issues a
//! single fetch to the database server; every request that arrives while the
//! fetch is outstanding waits in a queue and is replayed in arrival order
//! once the object is active. A failed or timed-out fetch drops the queue
//! without a trace on the wire.
//!
//! ### Location Tracking
//! An active object may be placed at a `(parent, zone)` location. Locations
//! are transient: they are never stored in the database and start out unset
//! on every load.
//!
//! ### Visibility Broadcasts
//! Observers subscribe to location channels. Placing an object announces it
//! to its new location, moving it also tells the old location, and deleting
//! it tells its current location. Objects without a location are invisible.
//!
//! ## Architecture Design
//!
//! ### Single Event Loop
//! One task owns the [`dispatcher::Dispatcher`] and with it the whole object
//! cache. Datagrams are handled one at a time, which serializes every
//! object's requests without locks.
//!
//! ### Asynchronous Database Access
//! Database requests are ordinary datagrams. Replies come back through the
//! router and are matched to the waiting load by a context number.
//!
//! ## Module Organization
//!
//! ### Store Module (`store`)
//! Database server contract: fetch and delete requests, context allocation
//! and reply decoding.
//!
//! ### Cache Module (`cache`)
//! Per-object load state machine and the queues of deferred requests.
//!
//! ### Broadcaster Module (`broadcaster`)
//! Enter, change and delete notifications on location channels.
//!
//! ### Dispatcher Module (`dispatcher`)
//! Decodes inbound datagrams and applies each request to the cache.
//!
//! ### Network Module (`network`)
//! UDP connection to the router, receiver and sender tasks, and the main
//! loop that also sweeps stale loads.
//!
//! ### Config Module (`config`)
//! TOML configuration file, command-line overrides and validation.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use dbss::config::AppConfig;
//! use dbss::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = AppConfig::from_toml(r#"
//!         [router]
//!         address = "127.0.0.1:7199"
//!
//!         [dbss]
//!         range_min = 9000
//!         range_max = 9999
//!         database = 200
//!     "#)?
//!     .validate()?;
//!
//!     // The context counter is seeded randomly so replies meant for an
//!     // earlier process cannot match a new load.
//!     let mut server = Server::new(&config, rand::random()).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod broadcaster;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod network;
pub mod object;
pub mod store;

pub use error::DispatchError;
