use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fleet_bus::{EventBus, HandlerResult, NamedLocks, SubscriptionId};
use fleet_core::db::{self, SharedConnection};
use fleet_core::types::now_rfc3339;
use fleet_core::{PageRequest, Pager};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::init_db;
use crate::engine::{TriggerEngine, TriggerHandle};
use crate::error::{Result, SchedulerError};
use crate::events::{ScheduleEvent, ScheduleTopic};
use crate::registry::ExecutorRegistry;
use crate::schedule::CronExpr;
use crate::store::{self, RecordStore, ScheduleStore};
use crate::task::{TaskFactory, TaskParams};
use crate::types::{
    ExecutorDescriptor, NewSchedule, Record, RecordFilter, Schedule, ScheduleFilter,
};
use crate::wrapper::JobWrapper;

/// The runtime half of the service: schedule id -> live trigger.
///
/// Bus handlers hold an `Arc` of this rather than of the service, so the bus
/// never owns the thing that owns the bus.
struct LiveTriggers {
    registry: Arc<ExecutorRegistry>,
    engine: Arc<dyn TriggerEngine>,
    locks: Arc<NamedLocks>,
    schedules: ScheduleStore,
    records: RecordStore,
    handles: DashMap<Uuid, TriggerHandle>,
}

impl LiveTriggers {
    fn add(&self, schedule: &Schedule) -> Result<()> {
        let slot = match self.handles.entry(schedule.id) {
            Entry::Occupied(_) => {
                debug!(schedule_id = %schedule.id, "already live, duplicate add ignored");
                return Ok(());
            }
            Entry::Vacant(slot) => slot,
        };

        let factory = self.registry.get(&schedule.executor)?;
        let cron = upcoming_cron(&schedule.cron_expr)?;
        dry_run(&schedule.executor, &factory, &TaskParams::new(schedule.params.clone()))?;

        let wrapper = Arc::new(JobWrapper::new(
            schedule.clone(),
            factory,
            Arc::clone(&self.locks),
            self.schedules.clone(),
            self.records.clone(),
        ));
        let handle = self.engine.register(cron, wrapper.into_trigger());
        slot.insert(handle);
        info!(schedule_id = %schedule.id, cron = %schedule.cron_expr, %handle, "schedule live");
        Ok(())
    }

    fn remove(&self, id: Uuid) {
        match self.handles.remove(&id) {
            Some((_, handle)) => {
                self.engine.remove(handle);
                info!(schedule_id = %id, %handle, "schedule removed from engine");
            }
            None => debug!(schedule_id = %id, "no live trigger, remove ignored"),
        }
    }

    fn clear(&self) {
        let ids: Vec<Uuid> = self.handles.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.remove(id);
        }
    }
}

/// Parse `expr` and require at least one fire time in the future.
fn upcoming_cron(expr: &str) -> Result<CronExpr> {
    let cron = CronExpr::parse(expr)?;
    if cron.next_after(Utc::now()).is_none() {
        return Err(SchedulerError::InvalidCron {
            expr: expr.to_string(),
            reason: "no fire time after now".to_string(),
        });
    }
    Ok(cron)
}

/// Configure a throwaway task with `params` to find out whether the executor
/// accepts them.
fn dry_run(executor: &str, factory: &TaskFactory, params: &TaskParams) -> Result<()> {
    let mut task = factory();
    task.set_params(params)
        .map_err(|e| SchedulerError::InvalidParams {
            executor: executor.to_string(),
            reason: e.to_string(),
        })
}

/// Schedule CRUD plus the live trigger set.
///
/// Every mutation commits first and then publishes on the bus; the bus
/// handlers installed by [`SchedulerService::initialize`] turn those events
/// into engine registrations.
pub struct SchedulerService {
    conn: SharedConnection,
    bus: Arc<EventBus<ScheduleEvent>>,
    live: Arc<LiveTriggers>,
    subscriptions: Mutex<Vec<(ScheduleTopic, SubscriptionId)>>,
}

impl SchedulerService {
    /// Build the service and make sure its tables exist. Triggers are not
    /// restored until [`initialize`](Self::initialize) runs.
    pub fn new(
        conn: SharedConnection,
        bus: Arc<EventBus<ScheduleEvent>>,
        registry: Arc<ExecutorRegistry>,
        engine: Arc<dyn TriggerEngine>,
    ) -> Result<Self> {
        init_db(&db::lock(&conn))?;
        let live = Arc::new(LiveTriggers {
            registry,
            engine,
            locks: Arc::clone(bus.locks()),
            schedules: ScheduleStore::new(conn.clone()),
            records: RecordStore::new(conn.clone()),
            handles: DashMap::new(),
        });
        Ok(Self {
            conn,
            bus,
            live,
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe the add/remove handlers, then publish an `Add` for every
    /// persisted enabled schedule. Returns how many schedules are live.
    #[instrument(skip(self))]
    pub fn initialize(&self) -> Result<usize> {
        {
            let mut subs = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
            if subs.is_empty() {
                let live = Arc::clone(&self.live);
                let add = self.bus.subscribe(
                    ScheduleTopic::Add,
                    "scheduler.add",
                    move |event: &ScheduleEvent| -> HandlerResult {
                        if let ScheduleEvent::Add(schedule) = event {
                            live.add(schedule)?;
                        }
                        Ok(())
                    },
                );
                let live = Arc::clone(&self.live);
                let remove = self.bus.subscribe(
                    ScheduleTopic::Remove,
                    "scheduler.remove",
                    move |event: &ScheduleEvent| -> HandlerResult {
                        if let ScheduleEvent::Remove(id) = event {
                            live.remove(*id);
                        }
                        Ok(())
                    },
                );
                subs.push((ScheduleTopic::Add, add));
                subs.push((ScheduleTopic::Remove, remove));
            }
        }

        let enabled = self.live.schedules.list_enabled()?;
        for schedule in enabled {
            self.bus.publish(&ScheduleEvent::Add(schedule));
        }
        let count = self.live_count();
        info!(live = count, "scheduler initialized");
        Ok(count)
    }

    fn validate(&self, input: &NewSchedule) -> Result<()> {
        if input.title.trim().is_empty() {
            return Err(SchedulerError::Validation("title must not be empty".to_string()));
        }
        upcoming_cron(&input.cron_expr)?;
        let factory = self.live.registry.get(&input.executor).map_err(|_| {
            SchedulerError::Validation(format!("unknown executor: {}", input.executor))
        })?;
        dry_run(&input.executor, &factory, &TaskParams::new(input.params.clone()))
    }

    #[instrument(skip(self, input), fields(title = %input.title))]
    pub fn add_schedule(&self, input: NewSchedule) -> Result<Schedule> {
        self.validate(&input)?;
        let now = now_rfc3339();
        let schedule = Schedule {
            id: Uuid::new_v4(),
            title: input.title.trim().to_string(),
            description: input.description,
            cron_expr: input.cron_expr.trim().to_string(),
            executor: input.executor,
            params: input.params,
            enabled: input.enabled,
            status: None,
            next_run: None,
            created_at: now.clone(),
            updated_at: now,
        };

        db::transaction(&self.conn, |tx| store::insert_schedule(tx, &schedule))?;
        info!(schedule_id = %schedule.id, "schedule added");

        if schedule.enabled {
            self.bus.publish(&ScheduleEvent::Add(schedule.clone()));
        }
        Ok(with_next_run(schedule))
    }

    /// Replace a schedule's fields. The live trigger is always removed and,
    /// if the schedule is still enabled, registered again from the new row.
    #[instrument(skip(self, input))]
    pub fn update_schedule(&self, id: Uuid, input: NewSchedule) -> Result<Schedule> {
        self.validate(&input)?;
        let updated = db::transaction(&self.conn, |tx| {
            let current = store::find_schedule(tx, id)?
                .ok_or(SchedulerError::ScheduleNotFound { id })?;
            let next = Schedule {
                title: input.title.trim().to_string(),
                description: input.description,
                cron_expr: input.cron_expr.trim().to_string(),
                executor: input.executor,
                params: input.params,
                enabled: input.enabled,
                updated_at: now_rfc3339(),
                ..current
            };
            store::update_schedule(tx, &next)?;
            Ok::<_, SchedulerError>(next)
        })?;
        info!(schedule_id = %id, enabled = updated.enabled, "schedule updated");

        self.bus.publish(&ScheduleEvent::Remove(id));
        if updated.enabled {
            self.bus.publish(&ScheduleEvent::Add(updated.clone()));
        }
        Ok(with_next_run(updated))
    }

    #[instrument(skip(self))]
    pub fn delete_schedule(&self, id: Uuid) -> Result<()> {
        db::transaction(&self.conn, |tx| store::soft_delete_schedule(tx, id))?;
        info!(schedule_id = %id, "schedule deleted");
        self.bus.publish(&ScheduleEvent::Remove(id));
        Ok(())
    }

    /// One schedule with its next fire time filled in (when enabled).
    pub fn detail_schedule(&self, id: Uuid) -> Result<Schedule> {
        self.live.schedules.detail(id).map(with_next_run)
    }

    pub fn page_schedules(&self, filter: &ScheduleFilter, req: PageRequest) -> Result<Pager<Schedule>> {
        Ok(self.live.schedules.page(filter, req)?.map(with_next_run))
    }

    pub fn detail_record(&self, id: Uuid) -> Result<Record> {
        self.live.records.detail(id)
    }

    pub fn page_records(&self, filter: &RecordFilter, req: PageRequest) -> Result<Pager<Record>> {
        self.live.records.page(filter, req)
    }

    /// Enable or disable many schedules at once. All ids must exist, otherwise
    /// nothing changes.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub fn batch_set_enable(&self, ids: &[Uuid], enabled: bool) -> Result<usize> {
        check_ids(ids)?;
        let changed = db::transaction(&self.conn, |tx| {
            ids.iter()
                .map(|id| store::set_schedule_enabled(tx, *id, enabled))
                .collect::<Result<Vec<_>>>()
        })?;

        for schedule in &changed {
            if enabled {
                self.bus.publish(&ScheduleEvent::Add(schedule.clone()));
            } else {
                self.bus.publish(&ScheduleEvent::Remove(schedule.id));
            }
        }
        info!(enabled, count = changed.len(), "schedules toggled");
        Ok(changed.len())
    }

    /// Soft-delete many schedules at once. All ids must exist, otherwise
    /// nothing changes.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub fn batch_delete(&self, ids: &[Uuid]) -> Result<usize> {
        check_ids(ids)?;
        db::transaction(&self.conn, |tx| {
            ids.iter()
                .try_for_each(|id| store::soft_delete_schedule(tx, *id))
        })?;

        for id in ids {
            self.bus.publish(&ScheduleEvent::Remove(*id));
        }
        info!(count = ids.len(), "schedules deleted");
        Ok(ids.len())
    }

    pub fn executors(&self) -> Vec<ExecutorDescriptor> {
        self.live.registry.list()
    }

    pub fn is_live(&self, id: Uuid) -> bool {
        self.live.handles.contains_key(&id)
    }

    pub fn live_count(&self) -> usize {
        self.live.handles.len()
    }

    /// Detach from the bus and stop every live trigger.
    pub fn shutdown(&self) {
        let subs: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for (topic, id) in subs {
            if let Err(e) = self.bus.unsubscribe(topic, id) {
                warn!("unsubscribe failed: {e}");
            }
        }
        self.live.clear();
        info!("scheduler stopped");
    }
}

fn check_ids(ids: &[Uuid]) -> Result<()> {
    if ids.is_empty() {
        return Err(SchedulerError::Validation("no schedule ids given".to_string()));
    }
    if ids.iter().any(Uuid::is_nil) {
        return Err(SchedulerError::Validation("nil schedule id".to_string()));
    }
    Ok(())
}

fn with_next_run(mut schedule: Schedule) -> Schedule {
    schedule.next_run = if schedule.enabled {
        CronExpr::parse(&schedule.cron_expr)
            .ok()
            .and_then(|cron| cron.next_after(Utc::now()))
            .map(|t| t.to_rfc3339())
    } else {
        None
    };
    schedule
}
