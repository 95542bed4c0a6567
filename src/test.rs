mod client;
pub(crate) mod util;
