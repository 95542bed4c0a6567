use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::{
    bson::doc,
    error::{ErrorKind, Result},
    event::{cmap::CmapEvent, sdam::SdamEvent},
    options::{ClientOptions, ReadPreference, ServerAddress, TagSet},
    runtime,
    sdam::{ServerType, TopologyDescription},
    test::util::{primary_reply, secondary_reply, EventBuffer, MockServer},
    Client,
};

const WAIT: Duration = Duration::from_secs(5);

fn fast_options(hosts: Vec<ServerAddress>) -> ClientOptions {
    ClientOptions::builder()
        .hosts(hosts)
        .repl_set_name("rs0".to_string())
        .heartbeat_freq(Duration::from_millis(50))
        .heartbeat_timeout(Duration::from_millis(500))
        .connect_timeout(Duration::from_millis(500))
        .build()
}

/// Waits until `condition` holds for the client's topology, panicking after `WAIT`.
async fn wait_until(client: &Client, condition: impl Fn(&TopologyDescription) -> bool) {
    runtime::timeout(WAIT, async {
        while !condition(&client.topology_description()) {
            runtime::delay_for(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

fn type_of(description: &TopologyDescription, address: &ServerAddress) -> Option<ServerType> {
    description
        .server_description(address)
        .map(|sd| sd.server_type())
}

/// A primary and a secondary tagged `dc: ny`, both aware of each other.
async fn replica_set() -> (MockServer, MockServer) {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;
    let hosts = [primary.address(), secondary.address()];
    primary.set_hello_reply(primary_reply("rs0", &hosts));
    secondary.set_hello_reply(secondary_reply("rs0", &hosts, doc! { "dc": "ny" }));
    (primary, secondary)
}

#[tokio::test]
async fn discovers_members_and_routes_reads() -> Result<()> {
    let (primary, secondary) = replica_set().await;

    // only the primary is seeded; the secondary is discovered through its host list
    let mut options = fast_options(vec![primary.address()]);
    options.min_secondaries = Some(1);
    let client = Client::with_options(options)?;
    assert!(client.wait_for_full_setup(WAIT).await);

    let description = client.topology_description();
    assert_eq!(
        description.primary().map(|sd| sd.address().clone()),
        Some(primary.address())
    );
    assert_eq!(
        type_of(&description, &secondary.address()),
        Some(ServerType::RsSecondary)
    );

    assert_eq!(client.select_server(&ReadPreference::Primary)?, primary.address());
    assert_eq!(
        client.select_server(&ReadPreference::Secondary { options: None })?,
        secondary.address()
    );

    let ny: TagSet = [("dc".to_string(), "ny".to_string())].into_iter().collect();
    let sf: TagSet = [("dc".to_string(), "sf".to_string())].into_iter().collect();
    assert_eq!(
        client.select_server_with_tags(&ReadPreference::Secondary { options: None }, vec![ny])?,
        secondary.address()
    );
    let error = client
        .select_server_with_tags(&ReadPreference::Secondary { options: None }, vec![sf.clone()])
        .unwrap_err();
    assert!(error.is_no_eligible_servers());
    assert!(client
        .select_server_with_tags(&ReadPreference::Primary, vec![sf])
        .is_err());

    primary.set_command_reply(doc! { "ok": 1, "pong": true });
    let mut connection = client.check_out(&primary.address(), None).await?;
    let reply = connection.send_command(doc! { "ping": 1 }, "admin").await?;
    assert_eq!(reply.get_bool("pong").ok(), Some(true));

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn default_read_preference_comes_from_options() -> Result<()> {
    let (primary, secondary) = replica_set().await;
    let hosts = vec![primary.address(), secondary.address()];

    let mut options = fast_options(hosts.clone());
    options.min_secondaries = Some(1);
    let client = Client::with_options(options)?;
    assert!(client.wait_for_full_setup(WAIT).await);
    assert_eq!(client.select_default_server()?, primary.address());
    client.shutdown().await;

    let mut options = fast_options(hosts);
    options.min_secondaries = Some(1);
    options.read_preference = Some(ReadPreference::Secondary { options: None });
    let client = Client::with_options(options)?;
    assert!(client.wait_for_full_setup(WAIT).await);
    assert_eq!(client.select_default_server()?, secondary.address());
    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn members_dropped_by_primary_are_removed() -> Result<()> {
    let (primary, secondary) = replica_set().await;
    let sdam_events = EventBuffer::<SdamEvent>::new();

    let mut options = fast_options(vec![primary.address(), secondary.address()]);
    options.sdam_event_handler = Some(sdam_events.handler());
    let client = Client::with_options(options)?;
    assert!(client.wait_for_full_setup(WAIT).await);

    primary.set_hello_reply(primary_reply("rs0", &[primary.address()]));
    let removed = secondary.address();
    wait_until(&client, |d| d.server_description(&removed).is_none()).await;

    let closed = sdam_events
        .wait_for_event(WAIT, |e| {
            matches!(e, SdamEvent::ServerClosed(ev) if ev.address == removed)
        })
        .await;
    assert!(closed.is_some());

    let error = client.check_out(&removed, None).await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn monitor_recovers_after_failure() -> Result<()> {
    let server = MockServer::start().await;
    server.set_hello_reply(primary_reply("rs0", &[server.address()]));
    let address = server.address();

    let client = Client::with_options(fast_options(vec![address.clone()]))?;
    assert!(client.wait_for_full_setup(WAIT).await);

    server.set_failing(true);
    wait_until(&client, |d| {
        type_of(d, &address) == Some(ServerType::Unknown)
    })
    .await;
    let description = client.topology_description();
    let sd = description.server_description(&address).unwrap();
    assert!(sd.error().is_some());
    assert!(sd.round_trip_time().is_none());
    assert!(client.select_server(&ReadPreference::Primary).is_err());

    server.set_failing(false);
    wait_until(&client, |d| {
        type_of(d, &address) == Some(ServerType::RsPrimary)
    })
    .await;
    assert_eq!(client.select_server(&ReadPreference::Primary)?, address);

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn application_error_clears_pool_and_requests_check() -> Result<()> {
    let server = MockServer::start().await;
    server.set_hello_reply(primary_reply("rs0", &[server.address()]));
    let address = server.address();
    let sdam_events = EventBuffer::<SdamEvent>::new();
    let cmap_events = EventBuffer::<CmapEvent>::new();

    // checks only happen on request for the duration of the test
    let mut options = fast_options(vec![address.clone()]);
    options.heartbeat_freq = Some(Duration::from_secs(60));
    options.sdam_event_handler = Some(sdam_events.handler());
    options.cmap_event_handler = Some(cmap_events.handler());
    let client = Client::with_options(options)?;
    assert!(client.wait_for_full_setup(WAIT).await);

    let connection = client.check_out(&address, None).await?;
    let error: crate::error::Error =
        std::io::Error::from(std::io::ErrorKind::ConnectionReset).into();
    client.handle_application_error(&address, error).await;

    let cleared = cmap_events
        .wait_for_event(WAIT, |e| matches!(e, CmapEvent::PoolCleared(_)))
        .await;
    assert!(cleared.is_some());
    let marked_unknown = sdam_events
        .wait_for_event(WAIT, |e| {
            matches!(
                e,
                SdamEvent::ServerDescriptionChanged(ev)
                    if ev.new_description.server_type() == ServerType::Unknown
            )
        })
        .await;
    assert!(marked_unknown.is_some());

    // the requested check brings the primary back long before the next heartbeat
    wait_until(&client, |d| {
        type_of(d, &address) == Some(ServerType::RsPrimary)
    })
    .await;

    // the connection predates the clear, so it is closed rather than pooled
    drop(connection);
    let closed = cmap_events
        .wait_for_event(WAIT, |e| matches!(e, CmapEvent::ConnectionClosed(_)))
        .await;
    assert!(closed.is_some());

    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_fails_waiting_checkouts() -> Result<()> {
    let server = MockServer::start().await;
    server.set_hello_reply(primary_reply("rs0", &[server.address()]));
    let address = server.address();

    let mut options = fast_options(vec![address.clone()]);
    options.max_pool_size = Some(1);
    let client = Client::with_options(options)?;
    assert!(client.wait_for_full_setup(WAIT).await);

    let _connection = client.check_out(&address, None).await?;
    let waiter = {
        let client = client.clone();
        let address = address.clone();
        runtime::spawn(async move { client.check_out(&address, None).await })
    };
    runtime::delay_for(Duration::from_millis(100)).await;

    client.shutdown().await;

    let error = runtime::timeout(WAIT, waiter).await?.unwrap_err();
    assert!(error.is_closed());

    let error = client.select_server(&ReadPreference::Primary).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Shutdown));
    assert!(client.check_out(&address, None).await.unwrap_err().is_closed());

    // shutting down twice is harmless
    client.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn invalid_options_are_rejected() {
    let options = ClientOptions::builder()
        .hosts(Vec::<ServerAddress>::new())
        .build();
    let error = Client::with_options(options).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
}
