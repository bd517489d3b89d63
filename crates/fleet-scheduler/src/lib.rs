//! `fleet-scheduler`: cron-driven execution of registered tasks.
//!
//! # Overview
//!
//! Schedules are persisted in SQLite (`schedules`); every run leaves an audit
//! row in `schedule_records`. The live trigger set is runtime-only state,
//! rebuilt from the enabled schedules by [`SchedulerService::initialize`] on
//! every boot.
//!
//! | Piece                 | Role                                                    |
//! |-----------------------|---------------------------------------------------------|
//! | [`ExecutorRegistry`]  | executor name -> task factory                           |
//! | [`JobWrapper`]        | named lock, running record, panic recovery, final record |
//! | [`CronEngine`]        | one Tokio timer task per live schedule                  |
//! | [`SchedulerService`]  | CRUD, publishes add/remove events, owns live handles    |

pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod registry;
pub mod schedule;
pub mod service;
pub mod store;
pub mod task;
pub mod types;
pub mod wrapper;

pub use engine::{CronEngine, TriggerEngine, TriggerFn, TriggerHandle};
pub use error::{Result, SchedulerError};
pub use events::{ScheduleEvent, ScheduleTopic};
pub use registry::ExecutorRegistry;
pub use schedule::CronExpr;
pub use service::SchedulerService;
pub use task::{register_test_executors, Task, TaskError, TaskFactory, TaskParams, TEST_EXECUTOR};
pub use types::{
    ExecutorDescriptor, NewSchedule, Record, RecordFilter, RecordStatus, Schedule, ScheduleFilter,
};
pub use wrapper::{Invocation, JobWrapper};
