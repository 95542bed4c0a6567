//! Replica set discovery, monitoring, server selection and connection pooling for MongoDB
//! drivers.
//!
//! The crate keeps an eventually-consistent view of every member of a replica set (the
//! topology), refreshes it from one independent monitor task per member, and routes each
//! operation to a member that satisfies a [`ReadPreference`](selection_criteria::ReadPreference).
//! Every member has its own bounded [`Connection`](cmap::Connection) pool.
//!
//! ```no_run
//! # async fn run() -> mongodb_replset::error::Result<()> {
//! use std::time::Duration;
//!
//! use mongodb_replset::{options::ClientOptions, selection_criteria::ReadPreference, Client};
//!
//! let options = ClientOptions::parse(
//!     "mongodb://a.example.com,b.example.com/?replicaSet=rs0&secondaryAcceptableLatencyMS=15",
//! )?;
//! let client = Client::with_options(options)?;
//! client.wait_for_full_setup(Duration::from_secs(5)).await;
//!
//! let read_pref = ReadPreference::Nearest {
//!     options: Default::default(),
//! };
//! let address = client.select_server(&read_pref)?;
//! let mut connection = client.check_out(&address, None).await?;
//! let reply = connection
//!     .send_command(mongodb_replset::bson::doc! { "ping": 1 }, "admin")
//!     .await?;
//! println!("{}: {}", address, reply);
//! // dropping the connection checks it back into its pool
//! drop(connection);
//!
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use ::bson;

mod client;
pub mod cmap;
pub mod error;
pub mod event;
mod hello;
mod runtime;
pub mod sdam;
pub mod selection_criteria;
mod serde_util;
#[cfg(test)]
mod test;
mod trace;

pub use crate::client::Client;

/// Contains the configuration types for the crate.
pub mod options {
    pub use crate::{
        client::options::{ClientOptions, ServerAddress, DEFAULT_PORT},
        cmap::options::ConnectionPoolOptions,
        sdam::SelectionStrategy,
        selection_criteria::{ReadPreference, ReadPreferenceMode, ReadPreferenceOptions, TagSet},
    };
}
