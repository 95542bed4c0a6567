use std::{collections::HashSet, time::Duration};

use pretty_assertions::assert_eq;
use rand::{rngs::SmallRng, SeedableRng};

use super::SelectionStrategy;
use crate::{
    bson::{doc, DateTime, Document},
    error::ErrorKind,
    options::{ReadPreferenceOptions, ServerAddress},
    sdam::description::topology::{
        test::{address, checked_server, primary, secondary, topology},
        TopologyDescription,
    },
    selection_criteria::{ReadPreference, TagSet},
};

const HOSTS: [&str; 4] = ["p:27017", "s1:27017", "s2:27017", "s3:27017"];

fn tag_set(pairs: &[(&str, &str)]) -> TagSet {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A primary at `p` with the given RTT, and secondaries `s1`, `s2`, `s3` with the given RTTs and
/// tags.
fn replica_set(primary_rtt: Option<u64>, secondaries: &[(u64, Document)]) -> TopologyDescription {
    let mut description = topology(&HOSTS, Some("rs0"));
    if let Some(rtt) = primary_rtt {
        description
            .update(checked_server("p:27017", primary("rs0", &HOSTS), rtt))
            .unwrap();
    }
    for ((rtt, tags), host) in secondaries.iter().zip(&HOSTS[1..]) {
        description
            .update(checked_server(
                host,
                secondary("rs0", &HOSTS, tags.clone()),
                *rtt,
            ))
            .unwrap();
    }
    description
}

fn read_pref_with_tags(read_pref: ReadPreference, tag_sets: Vec<TagSet>) -> ReadPreference {
    read_pref.with_tag_sets(tag_sets).unwrap()
}

fn secondary_pref() -> ReadPreference {
    ReadPreference::Secondary { options: None }
}

/// Every address that `read_pref` selects over many attempts.
fn selectable(
    description: &TopologyDescription,
    read_pref: &ReadPreference,
    strategy: SelectionStrategy,
) -> HashSet<ServerAddress> {
    let mut rng = SmallRng::seed_from_u64(7);
    (0..200)
        .map(|_| {
            description
                .select_server(read_pref, strategy, &mut rng)
                .unwrap()
        })
        .collect()
}

fn set(hosts: &[&str]) -> HashSet<ServerAddress> {
    hosts.iter().map(|h| address(h)).collect()
}

#[test]
fn primary_mode() {
    let description = replica_set(Some(20), &[(1, doc! {}), (1, doc! {})]);
    assert_eq!(
        selectable(
            &description,
            &ReadPreference::Primary,
            SelectionStrategy::LatencyWindow
        ),
        set(&["p:27017"])
    );

    let description = replica_set(None, &[(1, doc! {})]);
    let error = description
        .select_server(
            &ReadPreference::Primary,
            SelectionStrategy::LatencyWindow,
            &mut rand::rng(),
        )
        .unwrap_err();
    assert!(error.is_no_eligible_servers());
    assert_eq!(error.to_string(), "No replica set members available for query");
}

#[test]
fn first_matching_tag_set_wins() {
    let description = replica_set(
        Some(1),
        &[
            (1, doc! { "dc": "ny" }),
            (1, doc! { "dc": "sf", "rack": "1" }),
            (1, doc! { "dc": "sf", "rack": "2" }),
        ],
    );

    let read_pref = read_pref_with_tags(
        secondary_pref(),
        vec![
            tag_set(&[("dc", "la")]),
            tag_set(&[("dc", "sf")]),
            tag_set(&[("dc", "ny")]),
        ],
    );
    assert_eq!(
        selectable(&description, &read_pref, SelectionStrategy::LatencyWindow),
        set(&["s2:27017", "s3:27017"])
    );

    let read_pref = read_pref_with_tags(
        secondary_pref(),
        vec![tag_set(&[("dc", "sf"), ("rack", "2")])],
    );
    assert_eq!(
        selectable(&description, &read_pref, SelectionStrategy::LatencyWindow),
        set(&["s3:27017"])
    );
}

#[test]
fn empty_tag_set_matches_everything() {
    let description = replica_set(Some(1), &[(1, doc! { "dc": "ny" }), (1, doc! {})]);
    let read_pref = read_pref_with_tags(
        secondary_pref(),
        vec![tag_set(&[("dc", "la")]), TagSet::new()],
    );
    assert_eq!(
        selectable(&description, &read_pref, SelectionStrategy::LatencyWindow),
        set(&["s1:27017", "s2:27017"])
    );
}

#[test]
fn unmatched_tags_fail() {
    let description = replica_set(Some(1), &[(1, doc! { "dc": "ny" })]);
    let read_pref = read_pref_with_tags(secondary_pref(), vec![tag_set(&[("dc", "la")])]);
    let error = description
        .select_server(&read_pref, SelectionStrategy::LatencyWindow, &mut rand::rng())
        .unwrap_err();
    assert!(error.is_no_eligible_servers());
}

#[test]
fn preferred_modes_fall_back() {
    let no_secondaries = replica_set(Some(1), &[]);
    let no_primary = replica_set(None, &[(1, doc! {})]);

    let secondary_preferred = ReadPreference::SecondaryPreferred { options: None };
    assert_eq!(
        selectable(
            &no_secondaries,
            &secondary_preferred,
            SelectionStrategy::LatencyWindow
        ),
        set(&["p:27017"])
    );

    let primary_preferred = ReadPreference::PrimaryPreferred { options: None };
    assert_eq!(
        selectable(
            &no_primary,
            &primary_preferred,
            SelectionStrategy::LatencyWindow
        ),
        set(&["s1:27017"])
    );

    let both = replica_set(Some(1), &[(1, doc! {})]);
    assert_eq!(
        selectable(&both, &primary_preferred, SelectionStrategy::LatencyWindow),
        set(&["p:27017"])
    );
    assert_eq!(
        selectable(&both, &secondary_preferred, SelectionStrategy::LatencyWindow),
        set(&["s1:27017"])
    );
}

#[test]
fn unknown_servers_are_never_selected() {
    let description = topology(&HOSTS, Some("rs0"));
    for read_pref in [
        ReadPreference::Primary,
        ReadPreference::Nearest { options: None },
        ReadPreference::SecondaryPreferred { options: None },
    ] {
        assert!(description
            .select_server(&read_pref, SelectionStrategy::LatencyWindow, &mut rand::rng())
            .unwrap_err()
            .is_no_eligible_servers());
    }
}

#[test]
fn empty_topology_has_no_eligible_servers() {
    let description = topology(&[], Some("rs0"));
    for strategy in [SelectionStrategy::LatencyWindow, SelectionStrategy::Statistics] {
        for read_pref in [
            ReadPreference::Primary,
            ReadPreference::PrimaryPreferred { options: None },
            secondary_pref(),
            ReadPreference::SecondaryPreferred { options: None },
            ReadPreference::Nearest { options: None },
            read_pref_with_tags(secondary_pref(), vec![tag_set(&[("dc", "ny")])]),
        ] {
            let error = description
                .select_server(&read_pref, strategy, &mut rand::rng())
                .unwrap_err();
            assert!(error.is_no_eligible_servers(), "{read_pref:?} with {strategy:?}");
        }
    }
}

#[test]
fn nearest_and_tagged_secondary_with_unprobed_primary() {
    // the primary has never answered; A is in `dc: ny` at 12ms and B in `dc: sf` at 40ms
    let hosts = ["p:27017", "a:27017", "b:27017"];
    let mut description = topology(&hosts, Some("rs0"));
    description
        .update(checked_server(
            "a:27017",
            secondary("rs0", &hosts, doc! { "dc": "ny" }),
            12,
        ))
        .unwrap();
    description
        .update(checked_server(
            "b:27017",
            secondary("rs0", &hosts, doc! { "dc": "sf" }),
            40,
        ))
        .unwrap();

    assert_eq!(
        selectable(
            &description,
            &ReadPreference::Nearest { options: None },
            SelectionStrategy::LatencyWindow
        ),
        set(&["a:27017"])
    );
    assert_eq!(
        selectable(
            &description,
            &read_pref_with_tags(secondary_pref(), vec![tag_set(&[("dc", "sf")])]),
            SelectionStrategy::LatencyWindow
        ),
        set(&["b:27017"])
    );
}

#[test]
fn latency_window() {
    // the primary and s1 are within 15ms of each other, s2 is not
    let description = replica_set(Some(5), &[(12, doc! {}), (30, doc! {})]);
    let nearest = ReadPreference::Nearest { options: None };
    assert_eq!(
        selectable(&description, &nearest, SelectionStrategy::LatencyWindow),
        set(&["p:27017", "s1:27017"])
    );

    let mut description = description;
    description.local_threshold = Some(Duration::from_millis(100));
    assert_eq!(
        selectable(&description, &nearest, SelectionStrategy::LatencyWindow),
        set(&["p:27017", "s1:27017", "s2:27017"])
    );
}

#[test]
fn rank_orders_within_window() {
    let description = replica_set(Some(9), &[(3, doc! {}), (40, doc! {}), (6, doc! {})]);
    let candidates = description
        .suitable_servers(&ReadPreference::Nearest { options: None })
        .unwrap();

    let ranked = SelectionStrategy::LatencyWindow.rank(candidates, Duration::from_millis(15));
    let ranked: Vec<String> = ranked.iter().map(|s| s.address().to_string()).collect();
    assert_eq!(ranked, vec!["s1:27017", "s3:27017", "p:27017"]);
}

#[test]
fn statistics_picks_lowest_score() {
    let mut description = replica_set(Some(5), &[(4, doc! {}), (6, doc! {})]);

    // s1 is fast on average but erratic
    let s1 = description.servers.get_mut(&address("s1:27017")).unwrap();
    for ms in [1, 30, 1, 30] {
        s1.query_stats.add_sample(Duration::from_millis(ms));
    }

    let nearest = ReadPreference::Nearest { options: None };
    assert_eq!(
        selectable(&description, &nearest, SelectionStrategy::Statistics),
        set(&["p:27017"])
    );
}

#[test]
fn statistics_ignores_servers_without_samples() {
    let mut description = replica_set(Some(50), &[(1, doc! {})]);
    let s1 = description.servers.get_mut(&address("s1:27017")).unwrap();
    s1.query_stats = Default::default();

    let nearest = ReadPreference::Nearest { options: None };
    assert_eq!(
        selectable(&description, &nearest, SelectionStrategy::Statistics),
        set(&["p:27017"])
    );
}

#[test]
fn max_staleness_must_cover_heartbeat() {
    let description = replica_set(Some(1), &[(1, doc! {})]);
    let read_pref = ReadPreference::Secondary {
        options: Some(
            ReadPreferenceOptions::builder()
                .max_staleness(Duration::from_secs(30))
                .build(),
        ),
    };
    let error = description
        .select_server(&read_pref, SelectionStrategy::LatencyWindow, &mut rand::rng())
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
}

#[test]
fn stale_secondaries_are_filtered() {
    let now = DateTime::now().timestamp_millis();
    let last_write = |lag_secs: i64| {
        doc! { "lastWriteDate": DateTime::from_millis(now - lag_secs * 1000) }
    };

    let mut description = topology(&HOSTS, Some("rs0"));
    for (host, lag) in [("s1:27017", 0), ("s2:27017", 200)] {
        let mut reply = secondary("rs0", &HOSTS, doc! {});
        reply.insert("lastWrite", last_write(lag));
        description.update(checked_server(host, reply, 1)).unwrap();
    }

    let read_pref = ReadPreference::Secondary {
        options: Some(
            ReadPreferenceOptions::builder()
                .max_staleness(Duration::from_secs(120))
                .build(),
        ),
    };
    assert_eq!(
        selectable(&description, &read_pref, SelectionStrategy::LatencyWindow),
        set(&["s1:27017"])
    );
}

#[test]
fn staleness_saturates_with_huge_heartbeat_frequency() {
    let now = DateTime::now().timestamp_millis();
    let with_last_write = |reply: Document, lag_secs: i64| {
        let mut reply = reply;
        reply.insert(
            "lastWrite",
            doc! { "lastWriteDate": DateTime::from_millis(now - lag_secs * 1000) },
        );
        reply
    };
    let read_pref = ReadPreference::Secondary {
        options: Some(
            ReadPreferenceOptions::builder()
                .max_staleness(Duration::MAX)
                .build(),
        ),
    };

    // without a primary
    let mut description = topology(&HOSTS, Some("rs0"));
    description.heartbeat_freq = Some(Duration::MAX);
    for (host, lag) in [("s1:27017", 0), ("s2:27017", 200)] {
        let reply = with_last_write(secondary("rs0", &HOSTS, doc! {}), lag);
        description.update(checked_server(host, reply, 1)).unwrap();
    }
    assert_eq!(
        selectable(&description, &read_pref, SelectionStrategy::LatencyWindow),
        set(&["s1:27017", "s2:27017"])
    );

    // with a primary
    let reply = with_last_write(primary("rs0", &HOSTS), 0);
    description
        .update(checked_server("p:27017", reply, 1))
        .unwrap();
    assert_eq!(
        selectable(&description, &read_pref, SelectionStrategy::LatencyWindow),
        set(&["s1:27017", "s2:27017"])
    );
}

#[test]
fn strategy_names() {
    for name in ["ping", "latency", "PING"] {
        assert_eq!(
            name.parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::LatencyWindow
        );
    }
    for name in ["statistical", "statistics"] {
        assert_eq!(
            name.parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::Statistics
        );
    }
    assert!("fastest".parse::<SelectionStrategy>().is_err());
    assert_eq!(SelectionStrategy::default(), SelectionStrategy::LatencyWindow);
}
