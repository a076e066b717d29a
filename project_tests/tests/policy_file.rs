mod common;

use common::{fleet_of, manager, sos_report};
use lib_dispatch::{ActionOutcome, DispatchPolicy, DriverAction, NotifyMode, PolicyError};
use std::io::Write;

fn write_policy(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file
}

#[test]
fn policy_file_overrides_only_what_it_names() {
    let file = write_policy(
        r#"{
            // give up after the first refusal
            cancellation_cap: 1,
            notify_mode: 'broadcast',
        }"#,
    );
    let policy = DispatchPolicy::load(file.path()).unwrap();
    assert_eq!(policy.cancellation_cap, 1);
    assert_eq!(policy.notify_mode, NotifyMode::Broadcast);
    assert!(policy.exclude_cancelled_drivers);
    assert_eq!(policy.response_timeout(), None);
}

#[test]
fn broken_policy_files_are_reported() {
    let missing = DispatchPolicy::load("/definitely/not/here/policy.json5").unwrap_err();
    assert!(matches!(missing, PolicyError::Io(_)));

    let garbage = write_policy("{ cancellation_cap: ");
    assert!(matches!(DispatchPolicy::load(garbage.path()), Err(PolicyError::Parse(_))));

    let zero_timeout = write_policy("{ response_timeout_secs: 0 }");
    assert!(matches!(DispatchPolicy::load(zero_timeout.path()), Err(PolicyError::Invalid(_))));
}

#[tokio::test]
async fn loaded_cap_drives_the_lifecycle() {
    let file = write_policy("{ cancellation_cap: 1 }");
    let policy = DispatchPolicy::load(file.path()).unwrap();

    let store = fleet_of(3);
    let (_, manager) = manager(&store, policy);
    let created = manager.create_report(sos_report()).await.unwrap();

    let outcome = manager
        .driver_action(created.driver_id, created.assignment_id, DriverAction::Cancel)
        .await
        .unwrap();
    assert_eq!(outcome, ActionOutcome::Exhausted { attempts: 1 });
}
