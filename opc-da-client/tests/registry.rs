//! End-to-end scenarios against the in-process simulated server.

use std::time::Duration;

use opc_da_client::com::vtables::IOPCAsyncIO2;
use opc_da_client::com::{Interface, StatusCode};
use opc_da_client::sim::{SIM_PROG_ID, SimEvent, SimServer};
use opc_da_client::variant::{Value, VarType};
use opc_da_client::{
    ClientConfig, DataSource, EuInfo, EuType, ItemDef, ItemHandle, OpcError, OpcGroup, OpcServer,
    Quality,
};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

async fn next<T>(rx: &mut mpsc::Receiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event queue closed")
}

fn connect(sim: &SimServer) -> OpcServer {
    sim.connect(ClientConfig::default().with_client_name("registry-tests"))
        .unwrap()
}

fn add(group: &OpcGroup, ids: &[&str]) -> Vec<ItemHandle> {
    group
        .items()
        .add_items(ids)
        .unwrap()
        .into_iter()
        .map(|r| r.unwrap().server_handle)
        .collect()
}

#[test]
fn test_write_then_read_back_from_device() {
    let sim = SimServer::new();
    let server = connect(&sim);
    assert_eq!(server.prog_id(), SIM_PROG_ID);
    assert_eq!(sim.client_name().as_deref(), Some("registry-tests"));

    let group = server.groups().add("rw").unwrap();
    let before = chrono::Utc::now() - chrono::Duration::milliseconds(1);
    let handles = add(&group, &["X.Y"]);

    let initial = group.sync_read(DataSource::Device, &handles).unwrap();
    let initial = initial[0].as_ref().unwrap();
    assert_eq!(initial.value, Value::I32(0));
    assert!(initial.timestamp.unwrap() >= before);

    let written = group.sync_write(&handles, &[Value::I32(42)]).unwrap();
    assert!(written[0].is_ok());

    let read = group.sync_read(DataSource::Device, &handles).unwrap();
    let value = read[0].as_ref().unwrap();
    assert_eq!(value.value, Value::I32(42));
    assert!(value.quality.is_good());
    assert!(value.timestamp.unwrap() >= initial.timestamp.unwrap());
    assert_eq!(sim.tag("X.Y"), Some(Value::I32(42)));
    assert_eq!(
        group.items().by_server_handle(handles[0]).unwrap().unwrap().value,
        Some(Value::I32(42))
    );
}

#[test]
fn test_item_failures_are_attributed_by_position() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("attribution").unwrap();

    let added = group
        .items()
        .add_items(&["X.Y", "No.Such.Tag", "Simulation.Counter"])
        .unwrap();
    assert!(added[0].is_ok());
    assert_eq!(
        added[1].as_ref().unwrap_err().code(),
        StatusCode::OPC_E_UNKNOWNITEMID
    );
    assert!(added[2].is_ok());

    // Setpoint is write-only, so only the middle read fails.
    let group = server.groups().add("attribution-read").unwrap();
    let handles = add(&group, &["X.Y", "Simulation.Setpoint", "Simulation.Counter"]);
    let read = group.sync_read(DataSource::Device, &handles).unwrap();
    assert_eq!(read.len(), 3);
    assert!(read[0].is_ok());
    assert_eq!(read[1].as_ref().unwrap_err().code(), StatusCode::OPC_E_BADRIGHTS);
    assert!(read[2].is_ok());

    let written = group
        .sync_write(&handles[..2], &[Value::I32(1), Value::F32(2.5)])
        .unwrap();
    assert!(written.iter().all(Result::is_ok));
}

#[test]
fn test_read_only_write_fails_per_item() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("ro").unwrap();
    let handles = add(&group, &["Plant.Line1.Status"]);
    let written = group.sync_write(&handles, &[Value::U16(3)]).unwrap();
    assert_eq!(written[0].as_ref().unwrap_err().code(), StatusCode::OPC_E_BADRIGHTS);
    assert_eq!(sim.tag("Plant.Line1.Status"), Some(Value::U16(1)));
}

#[test]
fn test_group_teardown_order() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("life").unwrap();
    let _rx = group.subscribe_data_change().unwrap();
    assert!(group.is_subscribed());

    server.groups().remove(group.server_handle()).unwrap();
    assert!(group.is_released());
    assert_eq!(sim.group_count(), 0);

    let lifecycle: Vec<SimEvent> = sim
        .events()
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                SimEvent::GroupAdded { .. }
                    | SimEvent::GroupReleased { .. }
                    | SimEvent::GroupRemoved { .. }
                    | SimEvent::Advised { group: Some(_), .. }
                    | SimEvent::Unadvised { group: Some(_), .. }
            )
        })
        .collect();
    assert!(
        matches!(
            lifecycle.as_slice(),
            [
                SimEvent::GroupAdded { .. },
                SimEvent::Advised { .. },
                SimEvent::Unadvised { .. },
                SimEvent::GroupReleased { .. },
                SimEvent::GroupRemoved { in_use: false, .. },
            ]
        ),
        "{lifecycle:?}"
    );
}

#[test]
fn test_disconnect_releases_everything_once() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let first = server.groups().add("a").unwrap();
    server.groups().add("b").unwrap();
    add(&first, &["X.Y", "Simulation.Ramp"]);
    let _data = first.subscribe_data_change().unwrap();
    let _shutdown = server.subscribe_shutdown().unwrap();
    assert!(sim.live_objects() > 0);

    server.disconnect().unwrap();
    assert_eq!(sim.group_count(), 0);
    assert_eq!(sim.live_objects(), 0);
    assert_eq!(sim.over_releases(), 0);
    assert!(first.is_released());

    drop(server);
    assert_eq!(sim.over_releases(), 0);
}

#[test]
fn test_dropping_the_server_disconnects() {
    let sim = SimServer::new();
    {
        let server = connect(&sim);
        let group = server.groups().add("implicit").unwrap();
        add(&group, &["X.Y"]);
    }
    assert_eq!(sim.group_count(), 0);
    assert_eq!(sim.live_objects(), 0);
    assert_eq!(sim.over_releases(), 0);
}

#[test]
fn test_missing_group_interface_rolls_back() {
    let sim = SimServer::new();
    let server = connect(&sim);
    sim.refuse_interface(IOPCAsyncIO2::IID);

    let err = server.groups().add("partial").unwrap_err();
    assert_eq!(err.code(), Some(StatusCode::E_NOINTERFACE));
    assert_eq!(sim.group_count(), 0);
    assert_eq!(server.groups().count(), 0);
    assert!(
        sim.events()
            .iter()
            .any(|e| matches!(e, SimEvent::GroupRemoved { .. }))
    );

    drop(server);
    assert_eq!(sim.live_objects(), 0);
}

#[test]
fn test_duplicate_group_name_is_rejected() {
    let sim = SimServer::new();
    let server = connect(&sim);
    server.groups().add("same").unwrap();
    let err = server.groups().add("same").unwrap_err();
    assert_eq!(err.code(), Some(StatusCode::OPC_E_DUPLICATENAME));
    assert_eq!(server.groups().count(), 1);
}

#[test]
fn test_group_state_round_trip() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("state").unwrap();

    assert_eq!(group.set_update_rate(250).unwrap(), 300);
    assert_eq!(group.update_rate().unwrap(), 300);
    group.set_active(false).unwrap();
    assert!(!group.is_active().unwrap());
    group.set_name("renamed").unwrap();
    assert_eq!(group.name(), "renamed");
    assert_eq!(sim.group_names(), vec!["renamed".to_string()]);
    assert!(group.set_deadband(101.0).is_err());
}

#[test]
fn test_inactive_group_cache_read_is_out_of_service() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("inactive").unwrap();
    let handles = add(&group, &["X.Y"]);
    group.set_active(false).unwrap();

    let cached = group.sync_read(DataSource::Cache, &handles).unwrap();
    assert!(!cached[0].as_ref().unwrap().quality.is_good());
    let device = group.sync_read(DataSource::Device, &handles).unwrap();
    assert_eq!(device[0].as_ref().unwrap().quality, Quality::GOOD);
}

#[tokio::test]
async fn test_data_change_carries_item_ids() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("changes").unwrap();
    add(&group, &["X.Y", "Simulation.Text"]);
    let mut rx = group.subscribe_data_change().unwrap();

    sim.set_tag("X.Y", Value::I32(5));
    assert_eq!(sim.publish_updates(), 1);

    let event = next(&mut rx).await;
    assert_eq!(event.transaction_id, 0);
    assert_eq!(event.group, group.client_handle());
    assert!(event.master.is_ok());
    let x = event
        .items
        .iter()
        .find(|u| u.item_id.as_deref() == Some("X.Y"))
        .unwrap();
    assert_eq!(x.result.as_ref().unwrap().value, Value::I32(5));
}

#[tokio::test]
async fn test_async_read_and_write_complete() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("async").unwrap();
    let handles = add(&group, &["X.Y", "Simulation.Setpoint"]);
    let mut reads = group.subscribe_read_complete().unwrap();
    let mut writes = group.subscribe_write_complete().unwrap();

    let request = group
        .async_write(&handles, &[Value::I32(7), Value::F32(1.5)], 11)
        .unwrap();
    assert!(request.items.iter().all(Result::is_ok));
    let written = next(&mut writes).await;
    assert_eq!(written.transaction_id, 11);
    assert_eq!(written.items.len(), 2);
    assert!(written.items.iter().all(|w| w.result.is_ok()));
    assert_eq!(sim.tag("X.Y"), Some(Value::I32(7)));

    let request = group.async_read(&handles[..1], 12).unwrap();
    assert_ne!(request.cancel_id, 0);
    let read = next(&mut reads).await;
    assert_eq!(read.transaction_id, 12);
    assert_eq!(read.items[0].item_id.as_deref(), Some("X.Y"));
    assert_eq!(read.items[0].result.as_ref().unwrap().value, Value::I32(7));
}

#[tokio::test]
async fn test_async_refresh_sends_every_active_item() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("refresh").unwrap();
    add(&group, &["X.Y", "Simulation.Counter", "Simulation.Flag"]);
    let mut rx = group.subscribe_data_change().unwrap();

    group.async_refresh(DataSource::Cache, 21).unwrap();
    let event = next(&mut rx).await;
    assert_eq!(event.transaction_id, 21);
    assert_eq!(event.items.len(), 3);
}

#[tokio::test]
async fn test_cancelled_read_reports_cancel_complete() {
    let sim = SimServer::new();
    sim.set_async_delay(Duration::from_millis(300));
    let server = connect(&sim);
    let group = server.groups().add("cancel").unwrap();
    let handles = add(&group, &["X.Y"]);
    let mut cancels = group.subscribe_cancel_complete().unwrap();
    let mut reads = group.subscribe_read_complete().unwrap();

    let request = group.async_read(&handles, 31).unwrap();
    group.async_cancel(request.cancel_id).unwrap();

    let cancelled = next(&mut cancels).await;
    assert_eq!(cancelled.transaction_id, 31);
    assert!(reads.try_recv().is_err());
    assert!(group.async_cancel(request.cancel_id).is_err());
}

#[tokio::test]
async fn test_shutdown_reason_reaches_subscribers() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let mut first = server.subscribe_shutdown().unwrap();
    let mut second = server.subscribe_shutdown().unwrap();

    assert_eq!(sim.request_shutdown("maintenance window"), 1);
    assert_eq!(next(&mut first).await.reason, "maintenance window");
    assert_eq!(next(&mut second).await.reason, "maintenance window");
}

#[tokio::test]
async fn test_slow_subscriber_drops_are_counted() {
    let sim = SimServer::new();
    let config = ClientConfig::default()
        .with_intake_capacity(1)
        .with_subscriber_capacity(1);
    let server = sim.connect(config).unwrap();
    let group = server.groups().add("slow").unwrap();
    add(&group, &["X.Y"]);
    let mut rx = group.subscribe_data_change().unwrap();

    for i in 0..20 {
        sim.set_tag("X.Y", Value::I32(i));
        sim.publish_updates();
    }
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let drops = group.drop_counters();
        if drops.intake + drops.subscriber >= 17 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "{drops:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // The queue still yields what it kept.
    let _ = next(&mut rx).await;
}

#[test]
fn test_browse_collects_qualified_ids() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let browser = server.browser().unwrap();

    let mut seen = 0;
    let ids = browser.collect_item_ids(100, |_| seen += 1).unwrap();
    assert_eq!(seen, ids.len());
    assert!(ids.iter().any(|id| id == "Plant.Line1.Speed"));
    assert!(ids.iter().any(|id| id == "X.Y"));

    let limited = browser.collect_item_ids(3, |_| {}).unwrap();
    assert_eq!(limited.len(), 3);
}

#[test]
fn test_item_properties() {
    let sim = SimServer::new();
    let server = connect(&sim);

    let available = server.query_available_properties("X.Y").unwrap();
    assert!(available.iter().any(|p| p.id == 2));

    let values = server.get_item_properties("X.Y", &[2, 101, 9999]).unwrap();
    assert_eq!(values[0].as_ref().unwrap(), &Value::I32(0));
    assert_eq!(
        values[1].as_ref().unwrap(),
        &Value::String("Simulated tag X.Y".into())
    );
    assert!(values[2].is_err());
}

#[test]
fn test_server_status_and_error_text() {
    let sim = SimServer::new();
    let server = connect(&sim);
    server.groups().add("counted").unwrap();

    let status = server.status().unwrap();
    assert_eq!(status.group_count, 1);
    assert!(status.start_time.is_some());

    let text = server.describe(opc_da_client::sim::SIM_E_DEVICE_FAULT);
    assert!(text.contains("Simulated device fault"), "{text}");
}

#[test]
fn test_item_management() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("items").unwrap();
    let items = group.items();
    let handles = add(&group, &["X.Y", "Simulation.Counter"]);
    assert_eq!(items.count(), 2);
    assert_eq!(items.by_item_id("X.Y").unwrap().unwrap().server_handle, handles[0]);

    let toggled = items.set_active(&handles[1..], false).unwrap();
    assert!(toggled[0].is_ok());
    assert!(!items.by_server_handle(handles[1]).unwrap().unwrap().active);

    let removed = items.remove(&handles[..1]).unwrap();
    assert!(removed[0].is_ok());
    assert_eq!(items.count(), 1);
    assert!(items.by_item_id("X.Y").unwrap().is_none());

    let again = items.remove(&handles[..1]).unwrap();
    assert_eq!(again[0].as_ref().unwrap_err().code(), StatusCode::OPC_E_INVALIDHANDLE);
    assert!(items.remove(&[]).unwrap().is_empty());
}

#[test]
fn test_add_items_skips_client_handles_already_taken() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("handles").unwrap();
    let items = group.items();

    let explicit = items.add(&[ItemDef::new("X.Y", ItemHandle(1))]).unwrap();
    assert!(explicit[0].is_ok());
    let added = items.add_items(&["Simulation.Counter", "Simulation.Flag"]).unwrap();
    assert!(added.iter().all(Result::is_ok));

    assert_eq!(items.count(), 3);
    assert_eq!(items.by_client_handle(ItemHandle(1)).unwrap().unwrap().item_id, "X.Y");
    let counter = items.by_item_id("Simulation.Counter").unwrap().unwrap();
    assert_ne!(counter.client_handle, ItemHandle(1));
}

#[test]
fn test_duplicate_client_handles_are_rejected() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("duplicates").unwrap();
    let items = group.items();

    let within = items.add(&[
        ItemDef::new("X.Y", ItemHandle(5)),
        ItemDef::new("Simulation.Counter", ItemHandle(5)),
    ]);
    assert!(matches!(within, Err(OpcError::InvalidArgument(_))));
    assert_eq!(items.count(), 0);

    items.add(&[ItemDef::new("X.Y", ItemHandle(5))]).unwrap();
    let taken = items.add(&[ItemDef::new("Simulation.Counter", ItemHandle(5))]);
    assert!(matches!(taken, Err(OpcError::InvalidArgument(_))));
    assert_eq!(items.count(), 1);

    // A rejected call gives its claim back.
    let retried = items.add(&[ItemDef::new("Simulation.Counter", ItemHandle(6))]).unwrap();
    assert!(retried[0].is_ok());
}

#[test]
fn test_concurrent_adds_with_one_client_handle_register_once() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("racing").unwrap();

    let outcomes: Vec<_> = std::thread::scope(|scope| {
        let workers: Vec<_> = ["X.Y", "Simulation.Counter"]
            .into_iter()
            .map(|id| {
                let items = group.items();
                scope.spawn(move || items.add(&[ItemDef::new(id, ItemHandle(7))]))
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let winners = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(
        outcomes
            .iter()
            .any(|o| matches!(o, Err(OpcError::InvalidArgument(_))))
    );
    assert_eq!(group.items().count(), 1);
    assert!(group.items().by_client_handle(ItemHandle(7)).unwrap().is_some());
}

#[test]
fn test_released_group_leaves_the_registry() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("short-lived").unwrap();
    server.groups().add("kept").unwrap();

    group.release().unwrap();
    assert_eq!(sim.group_count(), 1);
    assert_eq!(server.groups().count(), sim.group_count());
    assert!(server.groups().get_by_name("short-lived").unwrap().is_none());
    assert!(matches!(
        server.groups().remove(group.server_handle()),
        Err(OpcError::NotFound(_))
    ));

    server.disconnect().unwrap();
    assert_eq!(sim.live_objects(), 0);
    assert_eq!(sim.over_releases(), 0);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "released twice")]
fn test_second_group_release_is_detected() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("twice").unwrap();
    group.release().unwrap();
    let _ = group.release();
}

#[test]
#[cfg(not(debug_assertions))]
fn test_second_group_release_is_detected() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("twice").unwrap();
    group.release().unwrap();
    assert!(matches!(group.release(), Err(OpcError::InvalidState(_))));
}

#[test]
fn test_empty_batches_skip_the_server() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("empty").unwrap();
    let items = group.items();

    assert!(items.add(&[]).unwrap().is_empty());
    assert!(items.add_items::<&str>(&[]).unwrap().is_empty());
    assert!(items.validate(&[], false).unwrap().is_empty());
    assert!(items.set_active(&[], true).unwrap().is_empty());
    assert!(items.set_client_handles(&[], &[]).unwrap().is_empty());
    assert!(items.set_datatypes(&[], &[]).unwrap().is_empty());
    assert!(group.sync_read(DataSource::Device, &[]).unwrap().is_empty());
    assert!(group.sync_write(&[], &[]).unwrap().is_empty());
    assert_eq!(items.count(), 0);
}

#[test]
fn test_validate_checks_without_adding() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("validate").unwrap();
    let items = group.items();

    let checked = items
        .validate(
            &[
                ItemDef::new("X.Y", ItemHandle(1)),
                ItemDef::new("No.Such.Tag", ItemHandle(2)),
                ItemDef::new("Simulation.Ramp", ItemHandle(3)).with_requested_type(VarType::R4),
            ],
            false,
        )
        .unwrap();
    assert_eq!(checked.len(), 3);
    assert_eq!(checked[0].as_ref().unwrap().canonical_type, VarType::I4);
    assert_eq!(
        checked[1].as_ref().unwrap_err().code(),
        StatusCode::OPC_E_UNKNOWNITEMID
    );
    assert_eq!(checked[2].as_ref().unwrap().canonical_type, VarType::R8);
    assert_eq!(items.count(), 0);
}

#[tokio::test]
async fn test_swapped_client_handles_still_resolve_item_ids() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("swap").unwrap();
    let items = group.items();
    let added = items
        .add(&[
            ItemDef::new("X.Y", ItemHandle(1)),
            ItemDef::new("Simulation.Counter", ItemHandle(2)),
        ])
        .unwrap();
    let handles: Vec<_> = added.into_iter().map(|r| r.unwrap().server_handle).collect();

    let swapped = items
        .set_client_handles(&handles, &[ItemHandle(2), ItemHandle(1)])
        .unwrap();
    assert!(swapped.iter().all(Result::is_ok));
    assert_eq!(items.count(), 2);
    assert_eq!(items.by_client_handle(ItemHandle(2)).unwrap().unwrap().item_id, "X.Y");
    assert_eq!(
        items.by_client_handle(ItemHandle(1)).unwrap().unwrap().item_id,
        "Simulation.Counter"
    );

    let mut reads = group.subscribe_read_complete().unwrap();
    group.async_read(&handles[..1], 5).unwrap();
    let read = next(&mut reads).await;
    assert_eq!(read.items[0].client_handle, ItemHandle(2));
    assert_eq!(read.items[0].item_id.as_deref(), Some("X.Y"));

    // Taking a handle from an item outside the call is refused.
    let clash = items.set_client_handles(&handles[..1], &[ItemHandle(1)]);
    assert!(matches!(clash, Err(OpcError::InvalidArgument(_))));
}

#[test]
fn test_set_datatypes_changes_read_values() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("datatypes").unwrap();
    let items = group.items();
    let handles = add(&group, &["X.Y", "Simulation.Counter"]);
    sim.set_tag("X.Y", Value::I32(3));

    let changed = items
        .set_datatypes(&handles, &[VarType::R8, VarType::R8.array_of()])
        .unwrap();
    assert!(changed[0].is_ok());
    assert_eq!(changed[1].as_ref().unwrap_err().code(), StatusCode::OPC_E_BADTYPE);
    assert_eq!(
        items.by_server_handle(handles[0]).unwrap().unwrap().requested_type,
        VarType::R8
    );
    assert_eq!(
        items.by_server_handle(handles[1]).unwrap().unwrap().requested_type,
        VarType::EMPTY
    );

    let read = group.sync_read(DataSource::Device, &handles[..1]).unwrap();
    assert_eq!(read[0].as_ref().unwrap().value, Value::F64(3.0));
}

#[test]
fn test_single_item_view() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("single").unwrap();
    let items = group.items();

    let item = items.add_item("X.Y").unwrap();
    assert_eq!(item.item_id().unwrap(), "X.Y");
    item.write(Value::I32(5)).unwrap();
    assert_eq!(item.read(DataSource::Device).unwrap().value, Value::I32(5));

    item.set_requested_type(VarType::R8).unwrap();
    assert_eq!(item.requested_type().unwrap(), VarType::R8);
    assert_eq!(item.read(DataSource::Device).unwrap().value, Value::F64(5.0));

    item.set_client_handle(ItemHandle(50)).unwrap();
    assert_eq!(item.client_handle().unwrap(), ItemHandle(50));
    item.set_active(false).unwrap();
    assert!(!item.is_active().unwrap());

    let status = items.add_item("Plant.Line1.Status").unwrap();
    let refused = status.write(Value::U16(2)).unwrap_err();
    assert_eq!(refused.code(), Some(StatusCode::OPC_E_BADRIGHTS));

    let missing = items.add_item("No.Such.Tag").unwrap_err();
    assert_eq!(missing.code(), Some(StatusCode::OPC_E_UNKNOWNITEMID));

    let found = items.get(item.server_handle()).unwrap().unwrap();
    assert_eq!(found.client_handle().unwrap(), ItemHandle(50));
    items.remove(&[item.server_handle()]).unwrap();
    assert!(matches!(item.record(), Err(OpcError::NotFound(_))));
}

#[test]
fn test_engineering_units() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("units").unwrap();
    let items = group.items();

    let ramp = items.add_item("Simulation.Ramp").unwrap();
    assert_eq!(ramp.eu_type().unwrap(), EuType::Analog);
    assert_eq!(
        ramp.eu_info().unwrap(),
        EuInfo::Analog {
            low: 0.0,
            high: 100.0
        }
    );

    let status = items.add_item("Plant.Line1.Status").unwrap();
    assert_eq!(status.eu_type().unwrap(), EuType::Enumerated);
    let EuInfo::Enumerated(names) = status.eu_info().unwrap() else {
        panic!("expected enumerated units");
    };
    assert_eq!(names[1], "Running");

    let plain = items.add_item("X.Y").unwrap();
    assert_eq!(plain.eu_info().unwrap(), EuInfo::NoUnits);
}

#[test]
fn test_item_defaults_change_at_runtime() {
    let sim = SimServer::new();
    let server = connect(&sim);
    let group = server.groups().add("defaults").unwrap();
    let items = group.items();
    assert!(items.defaults().active);

    items.set_default_requested_type(VarType::R8).unwrap();
    items.set_default_active(false).unwrap();
    items.set_default_access_path("").unwrap();
    let item = items.add_item("X.Y").unwrap();

    let record = item.record().unwrap();
    assert_eq!(record.requested_type, VarType::R8);
    assert!(!record.active);
    assert_eq!(item.read(DataSource::Device).unwrap().value, Value::F64(0.0));

    // Other groups keep the connection's defaults.
    let other = server.groups().add("other").unwrap();
    assert!(other.items().defaults().active);
}
