use serde::{Deserialize, Serialize};

use crate::{
    bson::{doc, DateTime, Document},
    cmap::Connection,
    error::Result,
    options::ServerAddress,
    sdam::ServerType,
    selection_criteria::TagSet,
};

/// The legacy name of the status command. Replica set members of every supported version answer
/// to it.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

/// The database the status command is run against.
pub(crate) const HELLO_COMMAND_DB: &str = "admin";

/// Construct the status command sent by server monitors.
pub(crate) fn hello_command() -> Document {
    doc! {
        LEGACY_HELLO_COMMAND_NAME: 1,
        "helloOk": true,
    }
}

/// Execute the status command on the given connection.
pub(crate) async fn run_hello(conn: &mut Connection, command: Document) -> Result<HelloReply> {
    let raw_command_response = conn.send_command(command, HELLO_COMMAND_DB).await?;
    let command_response: HelloCommandResponse =
        bson::from_document(raw_command_response.clone())?;

    Ok(HelloReply {
        server_address: conn.address().clone(),
        command_response,
        raw_command_response,
    })
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) raw_command_response: Document,
}

/// The fields of a `hello` reply used for replica set discovery. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Set on a primary (or a standalone).
    pub is_writable_primary: Option<bool>,

    /// Sent instead of `isWritablePrimary` by servers that predate `hello`.
    #[serde(rename = "ismaster")]
    pub is_master: Option<bool>,

    /// Electable members, as seen by the replying member.
    pub hosts: Option<Vec<String>>,

    /// Members with priority zero.
    pub passives: Option<Vec<String>>,

    pub arbiters: Option<Vec<String>>,

    /// `"isdbgrid"` from a mongos.
    pub msg: Option<String>,

    /// The replying member's own name in the replica set config.
    pub me: Option<String>,

    pub set_name: Option<String>,

    pub hidden: Option<bool>,

    pub secondary: Option<bool>,

    pub arbiter_only: Option<bool>,

    /// Set by a member that is still waiting for its replica set config, i.e. a ghost.
    #[serde(rename = "isreplicaset")]
    pub is_replica_set: Option<bool>,

    /// Used to estimate a secondary's staleness.
    pub last_write: Option<LastWrite>,

    /// Matched against read preference tag sets.
    pub tags: Option<TagSet>,
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastWrite {
    pub last_write_date: DateTime,
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::HelloCommandResponse;
    use crate::{bson::doc, sdam::ServerType};

    fn server_type(reply: crate::bson::Document) -> ServerType {
        crate::bson::from_document::<HelloCommandResponse>(reply)
            .unwrap()
            .server_type()
    }

    #[test]
    fn server_type_from_reply() {
        assert_eq!(
            server_type(doc! { "ismaster": true, "setName": "rs0", "ok": 1 }),
            ServerType::RsPrimary
        );
        assert_eq!(
            server_type(doc! { "ismaster": false, "secondary": true, "setName": "rs0" }),
            ServerType::RsSecondary
        );
        assert_eq!(
            server_type(doc! { "arbiterOnly": true, "setName": "rs0" }),
            ServerType::RsArbiter
        );
        assert_eq!(
            server_type(doc! { "secondary": true, "hidden": true, "setName": "rs0" }),
            ServerType::RsOther
        );
        assert_eq!(
            server_type(doc! { "ismaster": false, "isreplicaset": true }),
            ServerType::RsGhost
        );
        assert_eq!(server_type(doc! { "msg": "isdbgrid" }), ServerType::Mongos);
        assert_eq!(server_type(doc! { "ismaster": true }), ServerType::Standalone);
    }

    #[test]
    fn tags_and_last_write() {
        let reply: HelloCommandResponse = crate::bson::from_document(doc! {
            "ismaster": false,
            "secondary": true,
            "setName": "rs0",
            "tags": { "dc": "sf", "rack": "2" },
            "lastWrite": { "lastWriteDate": crate::bson::DateTime::from_millis(1000) },
            "hosts": ["a:27017", "b:27017"],
            // fields discovery doesn't use are skipped
            "helloOk": true,
            "setVersion": 3,
            "primary": "a:27017",
            "minWireVersion": 0,
            "maxWireVersion": 21,
        })
        .unwrap();

        let tags = reply.tags.unwrap();
        assert_eq!(tags.get("dc").map(String::as_str), Some("sf"));
        assert_eq!(
            reply.last_write.unwrap().last_write_date,
            crate::bson::DateTime::from_millis(1000)
        );
        assert_eq!(reply.hosts.unwrap().len(), 2);
    }
}
