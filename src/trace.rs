use bson::Bson;

use crate::{
    client::options::ServerAddress,
    sdam::TopologyDescription,
    selection_criteria::ReadPreference,
};

pub(crate) mod connection;
pub(crate) mod server_selection;
pub(crate) mod topology;

pub(crate) const CONNECTION_TRACING_EVENT_TARGET: &str = "mongodb_replset::connection";
pub(crate) const MONITOR_TRACING_EVENT_TARGET: &str = "mongodb_replset::monitor";
pub(crate) const SERVER_SELECTION_TRACING_EVENT_TARGET: &str = "mongodb_replset::server_selection";
pub(crate) const TOPOLOGY_TRACING_EVENT_TARGET: &str = "mongodb_replset::topology";

pub(crate) const DEFAULT_MAX_DOCUMENT_LENGTH_BYTES: usize = 1000;

pub(crate) trait TracingRepresentation {
    type Representation;

    fn tracing_representation(&self) -> Self::Representation;
}

impl TracingRepresentation for bson::oid::ObjectId {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_hex()
    }
}

impl TracingRepresentation for bson::Document {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        let mut json = Bson::Document(self.clone())
            .into_relaxed_extjson()
            .to_string();
        truncate_on_char_boundary(&mut json, DEFAULT_MAX_DOCUMENT_LENGTH_BYTES);
        json
    }
}

impl TracingRepresentation for crate::error::Error {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_string()
    }
}

impl TracingRepresentation for ReadPreference {
    type Representation = String;

    fn tracing_representation(&self) -> Self::Representation {
        self.to_string()
    }
}

impl TracingRepresentation for TopologyDescription {
    type Representation = String;

    fn tracing_representation(&self) -> Self::Representation {
        self.to_string()
    }
}

impl ServerAddress {
    pub(crate) fn port_tracing_representation(&self) -> Option<u16> {
        Some(self.effective_port())
    }
}

/// Truncates the given string at the closest UTF-8 character boundary >= the provided length.
/// If the new length is >= the current length, does nothing.
pub(crate) fn truncate_on_char_boundary(s: &mut String, new_len: usize) {
    let original_len = s.len();
    if original_len > new_len {
        let mut truncate_index = new_len;
        while !s.is_char_boundary(truncate_index) {
            truncate_index += 1;
        }
        s.truncate(truncate_index);
        // rounding up to a boundary may leave the string whole
        if truncate_index < original_len {
            s.push_str("...")
        }
    }
}
