//! Background change pipelines
//!
//! A pipeline owns one [`ChangeWatcher`] and a worker thread. Each change
//! starts a cycle: delivery is paused, the handler runs (a build, a shader
//! compile), delivery resumes. Changes already queued when a cycle starts are
//! folded into it; changes stamped before a cycle ends are discarded, later
//! ones start the next cycle.

use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{bounded, select, Sender};

use super::build_invoker::{ArtifactStager, BuildInvoker};
use super::queue::EventSender;
use super::watcher::{ChangeEvent, ChangeWatcher};
use crate::error::{EngineError, EngineResult};

/// Work run once per change cycle
pub trait ChangeHandler: Send + 'static {
    fn name(&self) -> &str;

    /// Handle every change covered by this cycle
    fn handle(&mut self, changes: &[ChangeEvent]) -> EngineResult<()>;
}

/// Outcome of one cycle
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub pipeline: String,
    pub changes: usize,
    pub result: Result<(), String>,
}

/// Rebuilds the package and stages its artifacts
pub struct BuildCycle {
    invoker: BuildInvoker,
    working_dir: PathBuf,
    stager: ArtifactStager,
}

impl BuildCycle {
    pub fn new(
        invoker: BuildInvoker,
        working_dir: impl Into<PathBuf>,
        stager: ArtifactStager,
    ) -> Self {
        Self {
            invoker,
            working_dir: working_dir.into(),
            stager,
        }
    }
}

impl ChangeHandler for BuildCycle {
    fn name(&self) -> &str {
        "build"
    }

    fn handle(&mut self, changes: &[ChangeEvent]) -> EngineResult<()> {
        if let Some(first) = changes.first() {
            log::info!("Attempting to hot-reload after change to {}", first.path.display());
        }
        self.invoker.invoke_with_retry(&self.working_dir)?;
        let staged = self.stager.stage()?;
        log::info!("Staged {} artifacts", staged.len());
        Ok(())
    }
}

/// Watcher plus worker thread running a [`ChangeHandler`]
pub struct WatchPipeline {
    name: String,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl WatchPipeline {
    /// Start watching and spawn the worker
    pub fn spawn<H: ChangeHandler>(
        watcher: ChangeWatcher,
        mut handler: H,
        reports: Option<EventSender<PipelineReport>>,
    ) -> EngineResult<Self> {
        watcher.start()?;
        let name = handler.name().to_string();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let events = watcher.events();

        let worker = std::thread::Builder::new()
            .name(format!("hotswap-{}", name))
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(events) -> first => {
                        let Ok(first) = first else { break };
                        let mut changes = vec![first];
                        while !changes.is_empty() {
                            changes.extend(watcher.try_events());

                            let result = {
                                let _paused = watcher.pause();
                                handler.handle(&changes)
                            };
                            let resumed = Instant::now();

                            // Anything queued before resume was covered by this cycle
                            let (fresh, stale): (Vec<ChangeEvent>, Vec<ChangeEvent>) = watcher
                                .try_events()
                                .into_iter()
                                .partition(|e| e.timestamp >= resumed);
                            if !stale.is_empty() {
                                log::debug!(
                                    "Discarded {} changes covered by the last {} cycle",
                                    stale.len(),
                                    handler.name()
                                );
                            }

                            if let Err(e) = &result {
                                log::error!("{} cycle failed: {}", handler.name(), e);
                            }
                            if let Some(reports) = &reports {
                                reports.send(PipelineReport {
                                    pipeline: handler.name().to_string(),
                                    changes: changes.len(),
                                    result: result.map_err(|e| e.to_string()),
                                });
                            }
                            changes = fresh;
                        }
                    }
                }
            })
            .map_err(|e| EngineError::Internal {
                message: format!("failed to spawn {} pipeline: {}", name, e),
            })?;

        log::info!("Started {} pipeline", name);
        Ok(Self {
            name,
            stop_tx: Some(stop_tx),
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the worker after its current cycle
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("{} pipeline worker panicked", self.name);
            }
            log::debug!("Stopped {} pipeline", self.name);
        }
    }
}

impl Drop for WatchPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hot_reload::queue::EventQueue;
    use crate::hot_reload::watcher::FileFilter;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Counting {
        cycles: Arc<AtomicUsize>,
        fail: bool,
    }

    impl ChangeHandler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn handle(&mut self, _changes: &[ChangeEvent]) -> EngineResult<()> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            if self.fail {
                Err(EngineError::BuildFailed { attempts: 3 })
            } else {
                Ok(())
            }
        }
    }

    fn wait_for_report(queue: &EventQueue<PipelineReport>) -> Option<PipelineReport> {
        for _ in 0..100 {
            if let Some(report) = queue.try_pop() {
                return Some(report);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        None
    }

    #[test]
    fn test_change_runs_one_cycle() {
        let temp_dir = TempDir::new().expect("temp dir");
        let cycles = Arc::new(AtomicUsize::new(0));
        let reports = EventQueue::new();
        let watcher =
            ChangeWatcher::new(temp_dir.path(), FileFilter::new(vec!["rs"])).expect("watcher");
        let mut pipeline = WatchPipeline::spawn(
            watcher,
            Counting {
                cycles: cycles.clone(),
                fail: false,
            },
            Some(reports.sender()),
        )
        .expect("spawn");

        fs::write(temp_dir.path().join("lib.rs"), "pub fn f() {}").expect("write");
        let report = wait_for_report(&reports).expect("cycle report");
        assert_eq!(report.pipeline, "counting");
        assert!(report.result.is_ok());

        pipeline.stop();
        assert!(cycles.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_failed_cycle_is_reported() {
        let temp_dir = TempDir::new().expect("temp dir");
        let reports = EventQueue::new();
        let watcher = ChangeWatcher::new(temp_dir.path(), FileFilter::any()).expect("watcher");
        let _pipeline = WatchPipeline::spawn(
            watcher,
            Counting {
                cycles: Arc::new(AtomicUsize::new(0)),
                fail: true,
            },
            Some(reports.sender()),
        )
        .expect("spawn");

        fs::write(temp_dir.path().join("shader.sc"), "void main() {}").expect("write");
        let report = wait_for_report(&reports).expect("cycle report");
        assert!(report.result.is_err());
    }
}
