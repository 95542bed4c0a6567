pub mod options;

use std::{sync::Arc, time::Duration};

use crate::{
    cmap::Connection,
    error::{Error, ErrorKind, Result},
    options::{ClientOptions, ServerAddress},
    sdam::{Topology, TopologyDescription},
    selection_criteria::{ReadPreference, TagSet},
    trace::server_selection::ServerSelectionEventEmitter,
};

/// This is the main entry point for the API. A `Client` monitors every member of a replica set,
/// selects the member an operation should run on and hands out pooled connections to it.
///
/// `Client` uses [`std::sync::Arc`](https://doc.rust-lang.org/std/sync/struct.Arc.html) internally,
/// so it can safely be shared across tasks. Monitoring stops and every pool closes once
/// [`Client::shutdown`] is called or the last clone is dropped.
///
/// ```no_run
/// # async fn run() -> mongodb_replset::error::Result<()> {
/// use mongodb_replset::{options::ClientOptions, selection_criteria::ReadPreference, Client};
///
/// let client = Client::with_options(ClientOptions::parse("mongodb://a,b/?replicaSet=rs0")?)?;
///
/// for _ in 0..5 {
///     let client = client.clone();
///     tokio::spawn(async move {
///         let address = client.select_server(&ReadPreference::Primary)?;
///         let _connection = client.check_out(&address, None).await?;
///         // run commands on the connection
///         mongodb_replset::error::Result::Ok(())
///     });
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    topology: Topology,
    options: ClientOptions,
}

impl Client {
    /// Creates a new `Client` and starts monitoring the seeds in `options`. This method does not
    /// wait for any member to be reached; use [`Client::wait_for_full_setup`] for that.
    ///
    /// This must be called from within a tokio runtime.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let inner = Arc::new(ClientInner {
            topology: Topology::new(options.clone()),
            options,
        });

        Ok(Self { inner })
    }

    /// Selects the address of a member that satisfies `read_pref`, using the configured
    /// [`SelectionStrategy`](crate::options::SelectionStrategy). Selection is made against the
    /// latest topology snapshot and does not wait for a suitable member to appear.
    pub fn select_server(&self, read_pref: &ReadPreference) -> Result<ServerAddress> {
        if self.inner.topology.is_closed() {
            return Err(ErrorKind::Shutdown.into());
        }

        let strategy = self.inner.options.selection_strategy.unwrap_or_default();
        let emitter =
            ServerSelectionEventEmitter::new(self.inner.topology.id(), read_pref, strategy);
        let description = self.inner.topology.description();
        emitter.emit_started_event(&description);

        match description.select_server(read_pref, strategy, &mut rand::rng()) {
            Ok(address) => {
                emitter.emit_succeeded_event(&address);
                Ok(address)
            }
            Err(error) => {
                emitter.emit_failed_event(&description, &error);
                Err(error)
            }
        }
    }

    /// Like [`Client::select_server`], using the configured
    /// [`read_preference`](crate::options::ClientOptions::read_preference), or
    /// [`ReadPreference::Primary`] when none is configured.
    pub fn select_default_server(&self) -> Result<ServerAddress> {
        match self.inner.options.read_preference {
            Some(ref read_pref) => self.select_server(read_pref),
            None => self.select_server(&ReadPreference::Primary),
        }
    }

    /// Like [`Client::select_server`], but with `tag_sets` replacing the tag sets of `read_pref`.
    pub fn select_server_with_tags(
        &self,
        read_pref: &ReadPreference,
        tag_sets: Vec<TagSet>,
    ) -> Result<ServerAddress> {
        let read_pref = read_pref.clone().with_tag_sets(tag_sets)?;
        self.select_server(&read_pref)
    }

    /// Checks out a connection to the member at `address`, waiting at most `timeout` (or the
    /// configured `waitQueueTimeoutMS`) for one to become available. Dropping the connection
    /// returns it to the pool.
    pub async fn check_out(
        &self,
        address: &ServerAddress,
        timeout: Option<Duration>,
    ) -> Result<Connection> {
        let server = match self.inner.topology.server(address) {
            Some(server) => server,
            None if self.inner.topology.is_closed() => return Err(ErrorKind::Shutdown.into()),
            None => {
                return Err(Error::invalid_argument(format!(
                    "{address} is not a member of the topology"
                )))
            }
        };

        server.pool.check_out(timeout).await
    }

    /// Reports an error that occurred while using a connection to `address`. Network errors mark
    /// the member as unknown, clear its pool and wake every monitor; other errors are ignored.
    pub async fn handle_application_error(&self, address: &ServerAddress, error: Error) {
        self.inner
            .topology
            .handle_application_error(address.clone(), error)
            .await;
    }

    /// Gets a snapshot of the current state of the replica set.
    pub fn topology_description(&self) -> TopologyDescription {
        self.inner.topology.description()
    }

    /// Waits until a primary and at least `minSecondaries` secondaries have been discovered.
    /// Returns false if that did not happen within `timeout`.
    pub async fn wait_for_full_setup(&self, timeout: Duration) -> bool {
        let min_secondaries = self.inner.options.min_secondaries.unwrap_or(0);
        self.inner
            .topology
            .watch()
            .wait_for_full_setup(timeout, min_secondaries)
            .await
    }

    /// Stops monitoring and closes every connection pool. Checkouts waiting on a pool fail, and
    /// later calls to [`Client::select_server`] return an error.
    pub async fn shutdown(&self) {
        self.inner.topology.shutdown().await;
    }
}
