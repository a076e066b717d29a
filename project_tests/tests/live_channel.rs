mod common;

use common::{fleet_of, sos_report};
use lib_dispatch::{
    AssignmentManager, DispatchError, DispatchPolicy, DriverAction, DriverId, FleetRegistry,
    NotifyMode, ResponderEvent, ResponderHub, Role,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

async fn next_event(session: &mut lib_dispatch::ResponderSession) -> Option<ResponderEvent> {
    timeout(Duration::from_secs(1), session.events.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn matched_driver_receives_the_report_over_the_hub() {
    let store = fleet_of(2);
    let hub = ResponderHub::spawn(store.clone());
    let manager = AssignmentManager::new(store.clone(), Arc::new(hub.clone()), DispatchPolicy::default());

    let mut near = hub.connect(DriverId(1), Role::Responder).unwrap();
    let mut far = hub.connect(DriverId(2), Role::Responder).unwrap();
    let created = manager.create_report(sos_report()).await.unwrap();

    let Some(ResponderEvent::NewReport(summary)) = next_event(&mut near).await else {
        panic!("driver 1 should have been notified");
    };
    assert_eq!(summary.report_id, created.report_id);
    assert_eq!(summary.photo_url.as_deref(), Some("/uploads/500_scene.jpg"));
    assert!(timeout(Duration::from_millis(100), far.events.recv()).await.is_err());

    // the cancellation pushes the report on to the next driver
    manager
        .driver_action(DriverId(1), created.assignment_id, DriverAction::Cancel)
        .await
        .unwrap();
    let Some(ResponderEvent::NewReport(summary)) = next_event(&mut far).await else {
        panic!("driver 2 should have been notified");
    };
    assert_eq!(summary.report_id, created.report_id);
}

#[tokio::test]
async fn broadcast_mode_reaches_every_connected_responder() {
    let store = fleet_of(3);
    let hub = ResponderHub::spawn(store.clone());
    let policy = DispatchPolicy {
        notify_mode: NotifyMode::Broadcast,
        ..DispatchPolicy::default()
    };
    let manager = AssignmentManager::new(store.clone(), Arc::new(hub.clone()), policy);

    let mut sessions: Vec<_> = (1..=3)
        .map(|id| hub.connect(DriverId(id), Role::Responder).unwrap())
        .collect();
    let created = manager.create_report(sos_report()).await.unwrap();

    for session in sessions.iter_mut() {
        let Some(ResponderEvent::NewReport(summary)) = next_event(session).await else {
            panic!("driver {} missed the broadcast", session.driver_id);
        };
        assert_eq!(summary.report_id, created.report_id);
    }
}

#[tokio::test]
async fn offline_driver_still_gets_the_assignment() {
    let store = fleet_of(1);
    let hub = ResponderHub::spawn(store.clone());
    let manager = AssignmentManager::new(store.clone(), Arc::new(hub.clone()), DispatchPolicy::default());

    let created = manager.create_report(sos_report()).await.unwrap();
    let pending = manager.pending_for_driver(DriverId(1)).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].assignment_id, created.assignment_id);
    assert!(hub.connected_drivers().await.unwrap().is_empty());
}

#[tokio::test]
async fn reconnect_replaces_the_old_connection() {
    let store = fleet_of(1);
    let hub = ResponderHub::spawn(store.clone());
    let manager = AssignmentManager::new(store.clone(), Arc::new(hub.clone()), DispatchPolicy::default());

    let mut old = hub.connect(DriverId(1), Role::Responder).unwrap();
    let mut new = hub.connect(DriverId(1), Role::Responder).unwrap();
    assert_ne!(old.connection_id, new.connection_id);

    // the superseded socket closes late; the new one must survive it
    hub.disconnect(DriverId(1), old.connection_id).unwrap();
    manager.create_report(sos_report()).await.unwrap();

    assert!(matches!(next_event(&mut new).await, Some(ResponderEvent::NewReport(_))));
    assert!(next_event(&mut old).await.is_none());
    assert_eq!(hub.connected_drivers().await.unwrap(), vec![DriverId(1)]);
}

#[tokio::test]
async fn public_callers_cannot_open_a_responder_channel() {
    let store = fleet_of(1);
    let hub = ResponderHub::spawn(store);
    let err = hub.connect(DriverId(1), Role::Public).unwrap_err();
    assert_eq!(err, DispatchError::Forbidden(Role::Public));
}

#[tokio::test]
async fn location_updates_move_the_driver_closer_to_new_reports() {
    let store = fleet_of(2);
    let hub = ResponderHub::spawn(store.clone());
    let manager = AssignmentManager::new(store.clone(), Arc::new(hub.clone()), DispatchPolicy::default());

    let _session = hub.connect(DriverId(2), Role::Responder).unwrap();
    hub.update_location(DriverId(2), 12.9, 77.6).unwrap();

    // location writes are flushed by a background task; wait until this one lands
    let mut moved = false;
    for _ in 0..50 {
        let fleet = store.available_fleet().await.unwrap();
        if fleet.iter().any(|c| c.driver_id == DriverId(2) && c.location.latitude == 12.9) {
            moved = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(moved, "location update never reached the fleet");

    let created = manager.create_report(sos_report()).await.unwrap();
    assert_eq!(created.driver_id, DriverId(2));
    assert!(hub.update_location(DriverId(2), 120.0, 0.0).is_err());
}
