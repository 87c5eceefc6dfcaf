//! Shared fixtures: an in-memory store, a scripted runner and a recording
//! notifier wired into every engine service

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use watchtower_core::{Monitor, Result, ResultData, Tenant, TenantMonitor, User};
use watchtower_engine::{
    Evaluator, EvaluatorConfig, ExclusionService, MonitorService, NoGateway, Reconciler,
    ReconcilerConfig, RecordingNotifier, Runtime, Scheduler, WatcherManager,
};
use watchtower_query::Registry;
use watchtower_runner::{Dispatcher, RunOutput, RunRequest, Runner};
use watchtower_store::{MemoryStore, Store, TenantStore};

pub const WATCHER_ROLE: &str = "admin";

type Script = Box<dyn Fn(&str) -> Result<RunOutput> + Send + Sync>;

/// Answers every query through a replaceable closure and logs the SQL
pub struct ScriptedRunner {
    script: Mutex<Script>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new(script: impl Fn(&str) -> Result<RunOutput> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Box::new(script)),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set(&self, script: impl Fn(&str) -> Result<RunOutput> + Send + Sync + 'static) {
        *self.script.lock() = Box::new(script);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, request: &RunRequest, _cancel: &CancellationToken) -> Result<RunOutput> {
        self.calls.lock().push(request.query.clone());
        (self.script.lock())(&request.query)
    }
}

/// The probe built by the evaluator with the default row limit
pub fn is_unfiltered(sql: &str) -> bool {
    sql.to_ascii_lowercase().ends_with("limit 10")
}

/// A table of monitor ids with the exclude-field placeholder column
pub fn monitor_rows(ids: &[&str]) -> ResultData {
    ResultData::new(
        vec!["id".into(), "tv_monitors__monitor_id".into()],
        ids.iter().map(|id| vec![json!(id), json!(id)]).collect(),
    )
}

pub fn rows(values: &[Value]) -> ResultData {
    ResultData::new(
        vec!["id".into()],
        values.iter().map(|v| vec![v.clone()]).collect(),
    )
}

/// Same answer for the monitor query and its unfiltered probe
pub fn answer(data: ResultData) -> impl Fn(&str) -> Result<RunOutput> + Send + Sync + 'static {
    move |_| Ok(RunOutput::single(data.clone()))
}

/// Separate answers for the monitor query and its unfiltered probe
pub fn answer_split(
    filtered: ResultData,
    unfiltered: ResultData,
) -> impl Fn(&str) -> Result<RunOutput> + Send + Sync + 'static {
    move |sql| {
        if is_unfiltered(sql) {
            Ok(RunOutput::single(unfiltered.clone()))
        } else {
            Ok(RunOutput::single(filtered.clone()))
        }
    }
}

pub fn exclusion_monitor() -> Monitor {
    Monitor::system("Monitors without owner", "select id from monitors")
        .with_exclude_field("monitors.monitor_id")
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub registry: Arc<Registry>,
    pub runner: Arc<ScriptedRunner>,
    pub notifier: Arc<RecordingNotifier>,
    pub reconciler: Arc<Reconciler>,
    pub evaluator: Arc<Evaluator>,
    pub watchers: Arc<WatcherManager>,
    pub runtime: Arc<Runtime>,
    pub scheduler: Scheduler,
    pub exclusions: ExclusionService,
    pub monitors: MonitorService,
    pub tenant: Tenant,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(EvaluatorConfig::default()).await
    }

    pub async fn with_config(config: EvaluatorConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn Store> = store.clone();
        let registry = Arc::new(Registry::builtin().unwrap());
        let runner = ScriptedRunner::new(answer(rows(&[])));
        let notifier = Arc::new(RecordingNotifier::new());

        let dispatcher = Arc::new(Dispatcher::new(runner.clone(), runner.clone()));
        let reconciler = Arc::new(Reconciler::new(
            shared.clone(),
            notifier.clone(),
            ReconcilerConfig::default(),
        ));
        let evaluator = Arc::new(Evaluator::new(
            shared.clone(),
            registry.clone(),
            dispatcher,
            reconciler.clone(),
            config,
        ));
        let watchers = Arc::new(WatcherManager::new(
            shared.clone(),
            reconciler.clone(),
            [WATCHER_ROLE.to_string()],
        ));
        let runtime = Arc::new(Runtime::new(5, store.clone(), Arc::new(NoGateway)));
        let scheduler = Scheduler::new(
            shared.clone(),
            registry.clone(),
            runtime.clone(),
            evaluator.clone(),
            watchers.clone(),
        );

        let tenant = Tenant::new("Acme");
        store.upsert_tenant(&tenant).await.unwrap();

        Self {
            exclusions: ExclusionService::new(shared.clone()),
            monitors: MonitorService::new(shared, registry.clone(), reconciler.clone()),
            store,
            registry,
            runner,
            notifier,
            reconciler,
            evaluator,
            watchers,
            runtime,
            scheduler,
            tenant,
        }
    }

    pub async fn user(&self, role: &str) -> User {
        let user = User::new(self.tenant.id, format!("{}@acme.io", uuid::Uuid::new_v4()), role);
        self.store.upsert_user(&user).await.unwrap();
        user
    }

    /// Save a monitor and bind it to the harness tenant with default watchers
    pub async fn bind(&self, monitor: Monitor) -> TenantMonitor {
        let monitor = self.monitors.create(monitor).await.unwrap();
        let tm = self.monitors.bind(self.tenant.id, monitor.id).await.unwrap();
        self.watchers.initialize(&tm).await.unwrap();
        tm
    }

    pub async fn evaluate(&self, tm: &TenantMonitor) -> watchtower_engine::Evaluation {
        self.evaluator
            .evaluate(tm.id, None, &CancellationToken::new())
            .await
            .unwrap()
    }
}
