use std::time::Duration;

use serde::Serialize;
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{client::options::ClientOptions, serde_util};

/// Contains the options for creating a connection pool.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConnectionPoolOptions {
    /// The maximum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool.
    ///
    /// The default is 10.
    pub max_pool_size: Option<u32>,

    /// The minimum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool. If fewer than `min_pool_size`
    /// connections are in the pool, connections will be added to the pool in the background.
    ///
    /// The default is that no minimum is enforced.
    pub min_pool_size: Option<u32>,

    /// Connections that have been ready for usage in the pool for longer than `max_idle_time`
    /// will not be used. A value of zero means that connections are never closed for being idle.
    #[serde(
        rename = "maxIdleTimeMS",
        serialize_with = "serde_util::duration_option_as_int_millis::serialize"
    )]
    pub max_idle_time: Option<Duration>,

    /// The amount of time a checkout request waits for a connection before failing with a
    /// `CheckoutTimeout` error. `None` means a request waits indefinitely.
    #[serde(
        rename = "waitQueueTimeoutMS",
        serialize_with = "serde_util::duration_option_as_int_millis::serialize"
    )]
    pub wait_queue_timeout: Option<Duration>,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            max_idle_time: options.max_idle_time,
            wait_queue_timeout: options.wait_queue_timeout,
        }
    }
}
