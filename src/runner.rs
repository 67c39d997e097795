use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::api::ApiServer;
use crate::config::TaroConfig;
use crate::error::TaroError;
use crate::execution::ExecutionState;
use crate::job::{ExecutionStateObserver, JobInfo, JobInstance};
use crate::listening::StateDispatcher;
use crate::persistence::{self, DisabledPersistence, Persistence, PersistingObserver};
use crate::plugin::{PluginRegistry, PLUGIN_PREFIX};

/// Drives job instances from creation to their terminal state.
///
/// While an instance runs, its control API is served and every transition
/// is stored, broadcast to listeners and passed to the loaded plugins.
#[derive(Clone)]
pub struct JobRunner {
    /// Directory holding the API and listener sockets.
    pub socket_dir: PathBuf,
    pub persistence: Arc<dyn Persistence>,
    pub plugins: BTreeMap<String, Arc<dyn ExecutionStateObserver>>,
    /// Whether transitions are broadcast to listener sockets.
    pub dispatch_states: bool,
}

impl JobRunner {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            persistence: Arc::new(DisabledPersistence),
            plugins: BTreeMap::new(),
            dispatch_states: true,
        }
    }

    /// Runner with the persistence backend and plugins selected by `config`.
    pub fn from_config(
        socket_dir: impl Into<PathBuf>,
        config: &TaroConfig,
        registry: &PluginRegistry,
    ) -> Result<Self> {
        let persistence = persistence::open(config).context("cannot open job history")?;
        Ok(Self {
            persistence,
            plugins: registry.discover(PLUGIN_PREFIX, config.plugins()),
            ..Self::new(socket_dir)
        })
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_plugins(mut self, plugins: BTreeMap<String, Arc<dyn ExecutionStateObserver>>) -> Self {
        self.plugins = plugins;
        self
    }

    /// Whether a disabled job entry matches `job_id`. Without persistence no
    /// job is disabled.
    pub fn is_disabled(&self, job_id: &str) -> bool {
        match self.persistence.read_disabled_jobs() {
            Ok(disabled) => disabled.iter().any(|d| d.matches(job_id)),
            Err(TaroError::PersistenceDisabled) => false,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "disabled_jobs_unreadable");
                false
            }
        }
    }

    fn register_observers(&self, instance: &JobInstance) {
        instance.add_state_observer(PersistingObserver::new(Arc::clone(&self.persistence)));
        for observer in self.plugins.values() {
            instance.add_shared_state_observer(Arc::clone(observer), None);
        }
        if self.dispatch_states {
            match StateDispatcher::new(&self.socket_dir) {
                Ok(dispatcher) => {
                    instance.add_state_observer(dispatcher);
                }
                Err(e) => tracing::warn!(error = %e, "state_dispatcher_not_created"),
            }
        }
    }

    /// Registers the runner's observers on the instance and starts its API.
    ///
    /// The API is optional for a running job: failing to start it is logged.
    fn prepare(&self, instance: &JobInstance) -> Option<ApiServer> {
        self.register_observers(instance);
        match ApiServer::start(&self.socket_dir, instance.clone()) {
            Ok(api) => Some(api),
            Err(e) => {
                tracing::warn!(instance_id = %instance.instance_id(), error = %e, "api_not_started");
                None
            }
        }
    }

    /// Runs the instance on the current thread and returns its final snapshot.
    pub fn run_blocking(&self, instance: &JobInstance) -> Result<JobInfo> {
        if instance.job_id().trim().is_empty() {
            bail!("Job id must not be empty");
        }
        if instance.instance_id().trim().is_empty() {
            bail!("Instance id must not be empty");
        }

        if self.is_disabled(instance.job_id()) {
            self.register_observers(instance);
            instance.set_state(ExecutionState::Disabled);
            tracing::warn!(
                job_id = %instance.job_id(),
                instance_id = %instance.instance_id(),
                "job_disabled"
            );
            return Ok(instance.create_info());
        }

        let mut api = self.prepare(instance);
        tracing::info!(
            job_id = %instance.job_id(),
            instance_id = %instance.instance_id(),
            "job_run_started"
        );
        instance.run();
        if let Some(api) = api.as_mut() {
            api.close();
        }

        let info = instance.create_info();
        tracing::info!(
            job_id = %info.job_id,
            instance_id = %info.instance_id,
            state = %info.state(),
            "job_run_finished"
        );
        Ok(info)
    }

    /// Runs the instance on the blocking thread pool.
    pub async fn run(&self, instance: JobInstance) -> Result<JobInfo> {
        let runner = self.clone();
        tokio::task::spawn_blocking(move || runner.run_blocking(&instance))
            .await
            .context("job runner task failed")?
    }
}
