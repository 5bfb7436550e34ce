use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};

use anyhow::bail;

use crate::engine::config::EngineConfig;
use crate::engine::EngineWorker;
use crate::logger::{self, Message};
use crate::play::manager::{GameManager, ManagerSettings};
use crate::play::task::TaskProvider;
use crate::report::EngineReport;
use crate::util::Res;

/// One provider bound to its engines and a manager budget.
struct TaskAssignment {
    provider_name: String,
    handles: Vec<JoinHandle<Res<()>>>,
}

/// Multiplexes a concurrency budget over task providers. Every allocated
/// manager gets its own thread and its own freshly started engine
/// process(es); reports are shared per engine display name.
pub struct GameManagerPool {
    max_concurrency: usize,
    allocated: Mutex<usize>,
    assignments: Mutex<Vec<TaskAssignment>>,
    reports: Mutex<BTreeMap<String, Arc<EngineReport>>>,
    settings: ManagerSettings,
}

impl GameManagerPool {
    pub fn new(max_concurrency: usize, settings: ManagerSettings) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            allocated: Mutex::new(0),
            assignments: Mutex::new(vec![]),
            reports: Mutex::new(BTreeMap::new()),
            settings,
        }
    }

    /// The shared report for one engine display name. Managers running the
    /// same configuration concurrently feed the same counters.
    pub fn report_for(&self, engine: &str) -> Arc<EngineReport> {
        self.reports
            .lock()
            .unwrap()
            .entry(engine.to_string())
            .or_insert_with(|| Arc::new(EngineReport::new(engine)))
            .clone()
    }

    pub fn reports(&self) -> Vec<Arc<EngineReport>> {
        self.reports.lock().unwrap().values().cloned().collect()
    }

    /// Allocates up to `max_managers` managers (bounded by the remaining
    /// concurrency budget), starts fresh engines on each, and runs the
    /// provider loop on their threads.
    pub fn add_task_provider(
        &self,
        provider: Arc<dyn TaskProvider>,
        config1: EngineConfig,
        config2: Option<EngineConfig>,
        max_managers: usize,
    ) -> Res<()> {
        let count = {
            let mut allocated = self.allocated.lock().unwrap();
            let available = self.max_concurrency.saturating_sub(*allocated);
            let count = available.min(max_managers.max(1));
            if count == 0 {
                bail!(
                    "No managers left for provider '{}' (concurrency {})",
                    provider.name(),
                    self.max_concurrency
                )
            }
            *allocated += count;
            count
        };
        let mut handles = vec![];
        for manager_idx in 0..count {
            let provider = provider.clone();
            let config1 = config1.clone();
            let config2 = config2.clone();
            let settings = self.settings.clone();
            let report1 = self.report_for(&config1.name);
            let report2 = config2.as_ref().map(|c| self.report_for(&c.name));
            let handle = Builder::new()
                .name(format!("manager {} #{manager_idx}", provider.name()))
                .spawn(move || -> Res<()> {
                    let first = Arc::new(EngineWorker::start(config1, report1)?);
                    let mut manager = GameManager::new(settings);
                    match config2 {
                        Some(config2) => {
                            let second =
                                Arc::new(EngineWorker::start(config2, report2.unwrap())?);
                            manager.set_engines(first, second);
                        }
                        None => manager.set_unique_engine(first),
                    }
                    let result = manager.compute_tasks(&provider);
                    manager.stop_engines();
                    result
                })?;
            handles.push(handle);
        }
        self.assignments.lock().unwrap().push(TaskAssignment {
            provider_name: provider.name().to_string(),
            handles,
        });
        Ok(())
    }

    /// Joins every manager. Individual manager failures are logged and
    /// tolerated; only a provider whose managers all failed is an error.
    pub fn wait_for_tasks(&self) -> Res<()> {
        let assignments = std::mem::take(&mut *self.assignments.lock().unwrap());
        for assignment in assignments {
            let total = assignment.handles.len();
            let mut failures = vec![];
            for handle in assignment.handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        logger::log(
                            Message::Warning,
                            &format!(
                                "A manager for '{}' failed: {err}",
                                assignment.provider_name
                            ),
                        );
                        failures.push(err);
                    }
                    Err(_) => {
                        logger::log(
                            Message::Error,
                            &format!(
                                "A manager thread for '{}' panicked",
                                assignment.provider_name
                            ),
                        );
                        failures.push(anyhow::anyhow!("manager thread panicked"));
                    }
                }
            }
            if !failures.is_empty() && failures.len() == total {
                bail!(
                    "All {total} managers for '{}' failed, first error: {}",
                    assignment.provider_name,
                    failures.remove(0)
                )
            }
        }
        Ok(())
    }
}
