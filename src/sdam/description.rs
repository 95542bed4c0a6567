pub(crate) mod server;
pub(crate) mod stats;
pub(crate) mod topology;
