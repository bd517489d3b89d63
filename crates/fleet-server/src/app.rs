use std::sync::Arc;

use fleet_bus::{EventBus, HandlerFailure};
use fleet_core::config::FleetConfig;
use fleet_core::db;
use fleet_scheduler::{
    register_test_executors, CronEngine, ExecutorRegistry, ScheduleEvent, ScheduleTopic,
    SchedulerService,
};
use fleet_script::{ScriptRunner, SshExecutor};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Every long-lived service, wired in dependency order.
pub struct App {
    pub engine: Arc<CronEngine>,
    pub scheduler: SchedulerService,
    pub scripts: ScriptRunner,
}

impl App {
    /// Open the database and construct every service. Nothing is scheduled
    /// until [`SchedulerService::initialize`] runs.
    pub fn build(config: &FleetConfig) -> anyhow::Result<Self> {
        let conn = db::open(&config.database.path)?;

        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        tokio::spawn(log_handler_failures(failures_rx));
        let bus = Arc::new(EventBus::<ScheduleEvent>::new().with_failure_sink(failures_tx));

        let registry = Arc::new(ExecutorRegistry::new());
        let engine = Arc::new(CronEngine::current()?);

        let scheduler = SchedulerService::new(
            conn.clone(),
            Arc::clone(&bus),
            Arc::clone(&registry),
            engine.clone(),
        )?;
        let scripts = ScriptRunner::new(
            conn,
            Arc::new(SshExecutor::new(&config.script)),
            &config.script,
        )?;

        if config.scheduler.register_test_executors {
            register_test_executors(&registry)?;
        }
        scripts.register(&registry)?;
        fleet_health::register(&registry, &config.health)?;

        Ok(Self {
            engine,
            scheduler,
            scripts,
        })
    }

    pub fn shutdown(&self) {
        self.scripts.shutdown();
        self.scheduler.shutdown();
        self.engine.shutdown();
    }
}

/// Logs every failed bus delivery.
async fn log_handler_failures(mut rx: mpsc::UnboundedReceiver<HandlerFailure<ScheduleTopic>>) {
    while let Some(failure) = rx.recv().await {
        warn!(
            topic = ?failure.topic,
            subscriber = %failure.subscriber,
            "event handler failed: {}",
            failure.reason
        );
    }
}

pub async fn serve(config: FleetConfig) -> anyhow::Result<()> {
    let app = App::build(&config)?;
    let live = app.scheduler.initialize()?;
    info!(
        live,
        executors = app.scheduler.executors().len(),
        "fleet-server started"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    app.shutdown();
    Ok(())
}
