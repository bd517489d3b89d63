use std::sync::Arc;
use std::time::Duration;

use fleet_bus::EventBus;
use fleet_core::db::{self, SharedConnection};
use fleet_core::{ErrorKind, PageRequest};
use fleet_scheduler::store::{RecordStore, ScheduleStore};
use fleet_scheduler::{
    register_test_executors, CronEngine, ExecutorRegistry, Invocation, JobWrapper, NewSchedule,
    RecordFilter, RecordStatus, ScheduleEvent, ScheduleFilter, SchedulerError, SchedulerService,
    TriggerEngine, TEST_EXECUTOR,
};
use uuid::Uuid;

const YEARLY: &str = "0 0 0 1 1 *";

struct Harness {
    conn: SharedConnection,
    bus: Arc<EventBus<ScheduleEvent>>,
    registry: Arc<ExecutorRegistry>,
    engine: Arc<CronEngine>,
    service: SchedulerService,
}

fn harness_on(conn: SharedConnection) -> Harness {
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(ExecutorRegistry::new());
    register_test_executors(&registry).unwrap();
    let engine = Arc::new(CronEngine::current().unwrap());
    let service = SchedulerService::new(
        conn.clone(),
        Arc::clone(&bus),
        Arc::clone(&registry),
        Arc::clone(&engine) as Arc<dyn TriggerEngine>,
    )
    .unwrap();
    service.initialize().unwrap();
    Harness {
        conn,
        bus,
        registry,
        engine,
        service,
    }
}

fn harness() -> Harness {
    harness_on(db::open_in_memory().unwrap())
}

fn input(cron: &str, params: &str, enabled: bool) -> NewSchedule {
    NewSchedule {
        title: "nightly probe".to_string(),
        description: String::new(),
        cron_expr: cron.to_string(),
        executor: TEST_EXECUTOR.to_string(),
        params: params.to_string(),
        enabled,
    }
}

#[tokio::test]
async fn enabling_yields_one_registration_and_duplicate_add_is_ignored() {
    let h = harness();
    let s = h.service.add_schedule(input(YEARLY, "{}", false)).unwrap();
    assert!(!h.service.is_live(s.id));
    assert_eq!(s.next_run, None);

    assert_eq!(h.service.batch_set_enable(&[s.id], true).unwrap(), 1);
    assert!(h.service.is_live(s.id));
    assert_eq!(h.engine.active(), 1);

    let stored = h.service.detail_schedule(s.id).unwrap();
    assert!(stored.next_run.is_some());
    for _ in 0..2 {
        let report = h.bus.publish(&ScheduleEvent::Add(stored.clone()));
        assert!(report.is_clean());
    }
    assert_eq!(h.service.live_count(), 1);
    assert_eq!(h.engine.active(), 1);

    h.service.batch_set_enable(&[s.id], false).unwrap();
    assert_eq!(h.service.live_count(), 0);
    assert_eq!(h.engine.active(), 0);
}

#[tokio::test]
async fn update_leaves_exactly_one_registration() {
    let h = harness();
    let s = h.service.add_schedule(input(YEARLY, "{}", true)).unwrap();
    assert_eq!(h.engine.active(), 1);

    let updated = h
        .service
        .update_schedule(s.id, input("0 30 * * * *", r#"{"message":"hi"}"#, true))
        .unwrap();
    assert_eq!(updated.cron_expr, "0 30 * * * *");
    assert_eq!(updated.created_at, s.created_at);
    assert_eq!(h.service.live_count(), 1);
    assert_eq!(h.engine.active(), 1);

    // The live definition follows the new hourly cadence, not the yearly one.
    let next = h.service.detail_schedule(s.id).unwrap().next_run.unwrap();
    let next = chrono::DateTime::parse_from_rfc3339(&next).unwrap();
    let until = next.with_timezone(&chrono::Utc) - chrono::Utc::now();
    assert_eq!(next.format("%M:%S").to_string(), "30:00");
    assert!(until <= chrono::Duration::hours(1));

    h.service
        .update_schedule(s.id, input("0 30 * * * *", "{}", false))
        .unwrap();
    assert!(!h.service.is_live(s.id));
    assert_eq!(h.engine.active(), 0);

    let missing = h
        .service
        .update_schedule(Uuid::new_v4(), input(YEARLY, "{}", true))
        .unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn invalid_input_is_rejected_before_persistence() {
    let h = harness();
    let cases = [
        NewSchedule {
            title: "   ".to_string(),
            ..input(YEARLY, "{}", true)
        },
        input("every five minutes", "{}", true),
        NewSchedule {
            executor: "ghost".to_string(),
            ..input(YEARLY, "{}", true)
        },
        input(YEARLY, "{not json", true),
        input("0 0 0 1 1 * 2020", "{}", true),
    ];
    for case in cases {
        let err = h.service.add_schedule(case).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{err}");
    }

    let page = h
        .service
        .page_schedules(&ScheduleFilter::default(), PageRequest::default())
        .unwrap();
    assert_eq!(page.total, 0);
    assert_eq!(h.engine.active(), 0);
}

#[tokio::test]
async fn delete_removes_live_trigger_and_row() {
    let h = harness();
    let s = h.service.add_schedule(input(YEARLY, "{}", true)).unwrap();
    h.service.delete_schedule(s.id).unwrap();

    assert!(!h.service.is_live(s.id));
    assert!(matches!(
        h.service.detail_schedule(s.id),
        Err(SchedulerError::ScheduleNotFound { .. })
    ));
    assert_eq!(
        h.service.delete_schedule(s.id).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn batch_delete_is_all_or_nothing() {
    let h = harness();
    let a = h.service.add_schedule(input(YEARLY, "{}", true)).unwrap();
    let b = h.service.add_schedule(input(YEARLY, "{}", true)).unwrap();

    let err = h.service.batch_delete(&[a.id, Uuid::nil()]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = h.service.batch_delete(&[a.id, Uuid::new_v4()]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.service.live_count(), 2);
    assert!(h.service.detail_schedule(a.id).is_ok());

    assert_eq!(h.service.batch_delete(&[a.id, b.id]).unwrap(), 2);
    assert_eq!(h.service.live_count(), 0);
}

#[tokio::test]
async fn unresolvable_add_event_is_dropped() {
    let h = harness();
    let mut s = h.service.add_schedule(input(YEARLY, "{}", false)).unwrap();
    s.executor = "ghost".to_string();
    s.enabled = true;

    let report = h.bus.publish(&ScheduleEvent::Add(s.clone()));
    assert_eq!(report.failed, 1);
    assert!(!h.service.is_live(s.id));
}

#[tokio::test]
async fn add_event_for_expired_cron_is_dropped_and_later_adds_still_register() {
    let h = harness();
    let mut s = h.service.add_schedule(input(YEARLY, "{}", false)).unwrap();
    s.enabled = true;

    let expired = fleet_scheduler::Schedule {
        cron_expr: "0 0 0 1 1 * 2020".to_string(),
        ..s.clone()
    };
    let report = h.bus.publish(&ScheduleEvent::Add(expired));
    assert_eq!(report.failed, 1);
    assert!(!h.service.is_live(s.id));
    assert_eq!(h.engine.active(), 0);

    let report = h.bus.publish(&ScheduleEvent::Add(s.clone()));
    assert!(report.is_clean());
    assert!(h.service.is_live(s.id));
    assert_eq!(h.engine.active(), 1);
}

#[tokio::test]
async fn initialize_rebuilds_live_set_from_storage() {
    let conn = db::open_in_memory().unwrap();
    {
        let first = harness_on(conn.clone());
        first.service.add_schedule(input(YEARLY, "{}", true)).unwrap();
        first.service.add_schedule(input(YEARLY, "{}", true)).unwrap();
        first.service.add_schedule(input(YEARLY, "{}", false)).unwrap();
        first.service.shutdown();
        assert_eq!(first.engine.active(), 0);
    }

    let second = harness_on(conn);
    assert_eq!(second.service.live_count(), 2);
    assert_eq!(second.engine.active(), 2);
    assert_eq!(second.service.executors()[0].name, TEST_EXECUTOR);
}

#[tokio::test(start_paused = true)]
async fn overlapping_invocations_are_dropped_not_queued() {
    let h = harness();
    let s = h
        .service
        .add_schedule(input(YEARLY, r#"{"message":"slow","sleep_ms":200}"#, false))
        .unwrap();

    let wrapper = JobWrapper::new(
        s.clone(),
        h.registry.get(TEST_EXECUTOR).unwrap(),
        Arc::clone(h.bus.locks()),
        ScheduleStore::new(h.conn.clone()),
        RecordStore::new(h.conn.clone()),
    );

    let (first, second) = tokio::join!(wrapper.invoke(), wrapper.invoke());
    let outcomes = [first, second];
    assert_eq!(
        outcomes.iter().filter(|o| **o == Invocation::Dropped).count(),
        1
    );
    assert!(outcomes.iter().any(|o| matches!(
        o,
        Invocation::Completed {
            status: RecordStatus::Success,
            ..
        }
    )));

    let filter = RecordFilter {
        schedule_id: Some(s.id),
        status: None,
    };
    let records = h.service.page_records(&filter, PageRequest::default()).unwrap();
    assert_eq!(records.total, 1);

    // The lock is released once the run finishes.
    assert!(matches!(wrapper.invoke().await, Invocation::Completed { .. }));
    assert!(!h.bus.locks().is_locked(&JobWrapper::lock_key(s.id)));
}

#[tokio::test(start_paused = true)]
async fn panicking_task_leaves_error_record_and_schedule_enabled() {
    let h = harness();
    let s = h
        .service
        .add_schedule(input("*/5 * * * * *", "", true))
        .unwrap();

    let filter = RecordFilter {
        schedule_id: Some(s.id),
        status: Some(RecordStatus::Error),
    };
    let mut records = h.service.page_records(&filter, PageRequest::default()).unwrap();
    for _ in 0..30 {
        if records.total > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        records = h.service.page_records(&filter, PageRequest::default()).unwrap();
    }

    assert!(records.total >= 1, "no error record was written");
    let record = &records.data[0];
    assert!(record
        .error
        .as_deref()
        .is_some_and(|e| e.contains("panicked")));

    let after = h.service.detail_schedule(s.id).unwrap();
    assert!(after.enabled);
    assert_eq!(after.status, Some(RecordStatus::Error));
    assert!(h.service.is_live(s.id));
}
