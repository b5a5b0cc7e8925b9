use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use walktest::{
    db::{PatientOrder, TestSession},
    handoff::RecoveryResult,
    reconciler::PatientWithHistory,
    AppState,
};

async fn wait_for<F>(
    view: &mut watch::Receiver<Vec<PatientWithHistory>>,
    mut accept: F,
) -> Vec<PatientWithHistory>
where
    F: FnMut(&[PatientWithHistory]) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let current = view.borrow_and_update();
                if accept(current.as_slice()) {
                    return current.clone();
                }
            }
            view.changed().await.expect("history view closed");
        }
    })
    .await
    .expect("history view never reached the expected state")
}

fn flag_of(view: &[PatientWithHistory], patient_id: &str) -> Option<bool> {
    view.iter()
        .find(|entry| entry.patient.id == patient_id)
        .map(|entry| entry.has_history)
}

#[tokio::test]
async fn writes_flow_through_to_the_history_view() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::open(dir.path(), CancellationToken::new())
        .await
        .unwrap();
    let mut view = state.history.subscribe();

    let patient = state.records.create_patient("Rosa").await.unwrap();
    assert_eq!(patient.numeric_id, 1001);
    wait_for(&mut view, |v| flag_of(v, &patient.id) == Some(false)).await;

    let sequence = state
        .records
        .next_sequence_number_for_patient(&patient.id)
        .await
        .unwrap();
    state
        .records
        .save_completed_session(&TestSession::new(&patient.id, sequence))
        .await
        .unwrap()
        .expect("session should verify");
    wait_for(&mut view, |v| flag_of(v, &patient.id) == Some(true)).await;

    // Stored flag goes stale; the view keeps following the live count.
    state.db.set_history_flag(&patient.id, false).await.unwrap();
    state.records.update_access_timestamp(&patient.id).await.unwrap();
    let current = wait_for(&mut view, |v| {
        v.iter()
            .any(|entry| entry.patient.id == patient.id && !entry.patient.has_history)
    })
    .await;
    assert_eq!(flag_of(&current, &patient.id), Some(true));

    state.records.delete_patient(&patient.id).await.unwrap();
    wait_for(&mut view, |v| flag_of(v, &patient.id).is_none()).await;
    assert_eq!(
        state
            .db
            .count_sessions_for_patient(&patient.id)
            .await
            .unwrap(),
        0
    );

    state.shutdown().await;
}

#[tokio::test]
async fn reopening_repairs_drifted_flags() {
    let dir = tempfile::tempdir().unwrap();
    let patient_id = {
        let state = AppState::open(dir.path(), CancellationToken::new())
            .await
            .unwrap();
        let patient = state.records.create_patient("Tomás").await.unwrap();
        state
            .records
            .save_numbered_session(&TestSession::new(&patient.id, 0))
            .await
            .unwrap();
        state.db.set_history_flag(&patient.id, false).await.unwrap();
        state.shutdown().await;
        patient.id
    };

    let state = AppState::open(dir.path(), CancellationToken::new())
        .await
        .unwrap();

    let stored = state.db.get_patient(&patient_id).await.unwrap().unwrap();
    assert!(stored.has_history);
    assert_eq!(flag_of(&state.history.current(), &patient_id), Some(true));
    assert_eq!(
        state.db.list_patients(PatientOrder::LastAccess).await.unwrap().len(),
        1
    );
    state.shutdown().await;
}

#[tokio::test]
async fn recovery_result_reaches_a_late_results_screen() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::open(dir.path(), CancellationToken::new())
        .await
        .unwrap();

    let result = RecoveryResult {
        spo2: Some(92),
        heart_rate: Some(110),
        is_recovery_period_over: true,
        was_data_captured_during_period: true,
    };
    assert!(state.recovery.publish(result));

    let mut screen = state.recovery.subscribe();
    assert_eq!(screen.try_recv(), Some(result));

    assert!(state.recovery.reset());
    let mut next_screen = state.recovery.subscribe();
    assert_eq!(next_screen.try_recv(), Some(RecoveryResult::pending()));

    // The first screen is still alive but idle; the second run must land.
    let second = RecoveryResult {
        spo2: Some(96),
        heart_rate: Some(88),
        ..result
    };
    assert!(state.recovery.publish(second));
    assert_eq!(state.recovery.subscribe().try_recv(), Some(second));
    drop(screen);

    state.shutdown().await;
}

#[tokio::test]
async fn shutdown_leaves_the_process_token_to_its_owner() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let state = AppState::open(dir.path(), cancel.clone()).await.unwrap();

    state.shutdown().await;

    assert!(!cancel.is_cancelled());
}

#[tokio::test]
async fn changing_the_order_rebuilds_the_history_view() {
    let dir = tempfile::tempdir().unwrap();
    let mut state = AppState::open(dir.path(), CancellationToken::new())
        .await
        .unwrap();
    state.records.create_patient("Zoe").await.unwrap();
    state.records.create_patient("ana").await.unwrap();

    state.set_patient_order(PatientOrder::Name).await.unwrap();

    let mut view = state.history.subscribe();
    let names: Vec<String> = wait_for(&mut view, |entries| entries.len() == 2)
        .await
        .into_iter()
        .map(|entry| entry.patient.name)
        .collect();
    assert_eq!(names, ["ana", "Zoe"]);
    assert_eq!(state.settings.patient_order(), PatientOrder::Name);

    state.shutdown().await;
}
