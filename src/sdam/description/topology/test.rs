use std::time::Duration;

use pretty_assertions::assert_eq;

use super::{verify_max_staleness, TopologyDescription, TopologyType};
use crate::{
    bson::{doc, Document},
    error::ErrorKind,
    hello::{HelloCommandResponse, HelloReply},
    options::{ClientOptions, ServerAddress},
    sdam::{description::server::ServerDescription, QueryStats, ServerType},
};

pub(crate) fn address(s: &str) -> ServerAddress {
    ServerAddress::parse(s).unwrap()
}

/// A description of `address` built from a successful check that returned `reply` in `rtt_ms`
/// milliseconds.
pub(crate) fn checked_server(address: &str, reply: Document, rtt_ms: u64) -> ServerDescription {
    let address = self::address(address);
    let rtt = Duration::from_millis(rtt_ms);
    let mut stats = QueryStats::new();
    stats.add_sample(rtt);

    let hello = HelloReply {
        server_address: address.clone(),
        command_response: crate::bson::from_document::<HelloCommandResponse>(reply.clone())
            .unwrap(),
        raw_command_response: reply,
    };
    ServerDescription::new_from_hello_reply(address, hello, rtt, stats)
}

pub(crate) fn primary(set_name: &str, hosts: &[&str]) -> Document {
    doc! { "ismaster": true, "setName": set_name, "hosts": hosts, "ok": 1 }
}

pub(crate) fn secondary(set_name: &str, hosts: &[&str], tags: Document) -> Document {
    doc! {
        "ismaster": false,
        "secondary": true,
        "setName": set_name,
        "hosts": hosts,
        "tags": tags,
        "ok": 1,
    }
}

pub(crate) fn topology(seeds: &[&str], set_name: Option<&str>) -> TopologyDescription {
    let options = ClientOptions::builder()
        .hosts(seeds.iter().map(|s| address(s)).collect::<Vec<_>>())
        .repl_set_name(set_name.map(String::from))
        .build();
    TopologyDescription::new(&options)
}

fn addresses(description: &TopologyDescription) -> Vec<String> {
    let mut addresses: Vec<String> = description
        .server_addresses()
        .map(ToString::to_string)
        .collect();
    addresses.sort();
    addresses
}

#[test]
fn seeds_start_unknown() {
    let description = topology(&["a:27017", "b:27017"], Some("rs0"));
    assert_eq!(description.topology_type(), TopologyType::ReplicaSetNoPrimary);
    assert_eq!(description.set_name(), Some("rs0"));
    assert!(description
        .servers()
        .all(|s| s.server_type() == ServerType::Unknown));
    assert!(description.primary().is_none());
}

#[test]
fn updates_for_unknown_addresses_are_ignored() {
    let mut description = topology(&["a:27017"], Some("rs0"));
    description
        .update(checked_server(
            "z:27017",
            primary("rs0", &["a:27017", "z:27017"]),
            1,
        ))
        .unwrap();
    assert_eq!(addresses(&description), vec!["a:27017"]);
    assert_eq!(description.topology_type(), TopologyType::ReplicaSetNoPrimary);
}

#[test]
fn primary_syncs_hosts() {
    let mut description = topology(&["a:27017", "stale:27017"], Some("rs0"));
    description
        .update(checked_server(
            "a:27017",
            primary("rs0", &["A:27017", "b:27017", "c:27017"]),
            1,
        ))
        .unwrap();

    assert_eq!(
        addresses(&description),
        vec!["a:27017", "b:27017", "c:27017"]
    );
    assert_eq!(
        description.topology_type(),
        TopologyType::ReplicaSetWithPrimary
    );
    assert_eq!(description.primary().unwrap().address(), &address("a:27017"));
    assert_eq!(
        description
            .server_description(&address("b:27017"))
            .unwrap()
            .server_type(),
        ServerType::Unknown
    );
}

#[test]
fn secondaries_add_hosts() {
    let mut description = topology(&["a:27017"], Some("rs0"));
    description
        .update(checked_server(
            "a:27017",
            secondary("rs0", &["a:27017", "b:27017"], doc! {}),
            1,
        ))
        .unwrap();

    assert_eq!(addresses(&description), vec!["a:27017", "b:27017"]);
    assert_eq!(description.topology_type(), TopologyType::ReplicaSetNoPrimary);
}

#[test]
fn new_primary_demotes_old_primary() {
    let hosts = ["a:27017", "b:27017"];
    let mut description = topology(&hosts, Some("rs0"));
    description
        .update(checked_server("a:27017", primary("rs0", &hosts), 1))
        .unwrap();
    description
        .update(checked_server("b:27017", primary("rs0", &hosts), 1))
        .unwrap();

    assert_eq!(description.servers_with_type(&[ServerType::RsPrimary]).count(), 1);
    assert_eq!(description.primary().unwrap().address(), &address("b:27017"));
    assert_eq!(
        description
            .server_description(&address("a:27017"))
            .unwrap()
            .server_type(),
        ServerType::Unknown
    );
}

#[test]
fn set_name_mismatch_removes_member() {
    let mut description = topology(&["a:27017", "b:27017"], Some("rs0"));
    let error = description
        .update(checked_server(
            "b:27017",
            secondary("other", &["b:27017"], doc! {}),
            1,
        ))
        .unwrap_err();

    match *error.kind {
        ErrorKind::SetNameMismatch {
            ref address,
            ref expected,
            ref actual,
        } => {
            assert_eq!(address, &self::address("b:27017"));
            assert_eq!(expected, "rs0");
            assert_eq!(actual, "other");
        }
        ref other => panic!("expected set name mismatch, got {other:?}"),
    }
    assert_eq!(addresses(&description), vec!["a:27017"]);
}

#[test]
fn set_name_is_adopted_from_first_member() {
    let mut description = topology(&["a:27017", "b:27017"], None);
    description
        .update(checked_server(
            "a:27017",
            secondary("rs1", &["a:27017", "b:27017"], doc! {}),
            1,
        ))
        .unwrap();
    assert_eq!(description.set_name(), Some("rs1"));

    assert!(description
        .update(checked_server(
            "b:27017",
            secondary("rs2", &["a:27017", "b:27017"], doc! {}),
            1,
        ))
        .is_err());
    assert_eq!(addresses(&description), vec!["a:27017"]);
}

#[test]
fn non_members_are_removed() {
    let mut description = topology(&["a:27017", "b:27017"], Some("rs0"));
    description
        .update(checked_server("a:27017", doc! { "ismaster": true, "ok": 1 }, 1))
        .unwrap();
    description
        .update(checked_server("b:27017", doc! { "msg": "isdbgrid", "ok": 1 }, 1))
        .unwrap();
    assert!(addresses(&description).is_empty());
}

#[test]
fn failed_check_marks_server_unknown() {
    let mut description = topology(&["a:27017"], Some("rs0"));
    let checked = checked_server("a:27017", primary("rs0", &["a:27017"]), 4);
    let last_update_time = checked.last_update_time();
    description.update(checked).unwrap();

    let previous = description.server_description(&address("a:27017")).cloned();
    let failed = ServerDescription::new_from_error(
        address("a:27017"),
        std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into(),
        previous.as_ref(),
    );
    description.update(failed).unwrap();

    let server = description.server_description(&address("a:27017")).unwrap();
    assert_eq!(server.server_type(), ServerType::Unknown);
    assert!(server.error().unwrap().is_network_error());
    assert_eq!(server.last_update_time(), last_update_time);
    assert_eq!(server.query_stats().count(), 1);
    assert!(server.round_trip_time().is_none());
    assert!(server.tags().is_none());
    assert_eq!(description.topology_type(), TopologyType::ReplicaSetNoPrimary);
}

#[test]
fn full_setup() {
    let hosts = ["a:27017", "b:27017", "c:27017"];
    let mut description = topology(&hosts, Some("rs0"));
    assert!(description.full_setup(0).is_none());

    description
        .update(checked_server("a:27017", primary("rs0", &hosts), 1))
        .unwrap();
    assert_eq!(description.full_setup(0), Some((address("a:27017"), 0)));
    assert!(description.full_setup(1).is_none());

    description
        .update(checked_server("b:27017", secondary("rs0", &hosts, doc! {}), 1))
        .unwrap();
    assert_eq!(description.full_setup(1), Some((address("a:27017"), 1)));
}

#[test]
fn diff() {
    let mut old = topology(&["a:27017", "b:27017"], Some("rs0"));
    old.update(checked_server(
        "b:27017",
        secondary("rs0", &["a:27017", "b:27017"], doc! {}),
        1,
    ))
    .unwrap();

    let mut new = old.clone();
    assert!(old.diff(&new).is_none());

    new.update(checked_server(
        "a:27017",
        primary("rs0", &["a:27017", "c:27017"]),
        1,
    ))
    .unwrap();

    let diff = old.diff(&new).unwrap();
    assert!(diff.added_addresses.contains(&address("c:27017")));
    assert!(diff.removed_addresses.contains(&address("b:27017")));
    assert!(diff.changed_servers.contains_key(&address("a:27017")));
}

#[test]
fn rtt_changes_alone_are_not_a_diff() {
    let old = {
        let mut d = topology(&["a:27017"], Some("rs0"));
        d.update(checked_server("a:27017", primary("rs0", &["a:27017"]), 1))
            .unwrap();
        d
    };
    let mut new = old.clone();
    new.update(checked_server("a:27017", primary("rs0", &["a:27017"]), 9))
        .unwrap();
    assert!(old.diff(&new).is_none());
}

#[test]
fn max_staleness_lower_bound() {
    let heartbeat = Duration::from_secs(1);
    assert!(verify_max_staleness(Duration::from_secs(90), heartbeat).is_ok());

    let error = verify_max_staleness(Duration::from_secs(89), heartbeat).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
    assert!(error.to_string().contains("at least 90 seconds"));

    let error =
        verify_max_staleness(Duration::from_secs(100), Duration::from_secs(95)).unwrap_err();
    assert!(error.to_string().contains("at least 105 seconds"));
}

#[test]
fn display() {
    let mut description = topology(&["a:27017"], Some("rs0"));
    description
        .update(checked_server("a:27017", primary("rs0", &["a:27017"]), 1))
        .unwrap();
    let s = description.to_string();
    assert!(s.starts_with("{ Type: ReplicaSetWithPrimary, Set Name: rs0, Servers: [ "));
    assert!(s.contains("Address: a:27017, Type: RSPrimary"));
}
