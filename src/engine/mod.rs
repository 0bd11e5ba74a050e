//! The fixed-point scheduler.
//!
//! There is no precomputed dependency graph. Each pass walks the pending
//! tasks in order and runs every task whose inputs are not outputs of a
//! still pending task. Outputs produced in a pass become visible to other
//! tasks in the next one. Tasks created by builders while they run are folded
//! in after the pass, so the task set grows until nothing is left to do.

mod stall;

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use camino::Utf8PathBuf;
use tracing::{Level, debug, error, info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::builder::BuildContext;
use crate::cache::{CacheKey, ResourceCache};
use crate::core::{CancelToken, Options, Signature};
use crate::error::{BuildError, CacheError, KilnError};
use crate::factory::TaskFactory;
use crate::state::State;
use crate::task::{Task, TaskResult};

/// What happened during one run of the engine.
#[derive(Debug, Default)]
pub struct RunOutcome {
    /// Results of the tasks that were executed, in execution order.
    pub results: Vec<TaskResult>,
    /// Set when the run stopped on an unexpected failure or could not make
    /// progress.
    pub aborted: Option<KilnError>,
    pub cancelled: bool,
    pub passes: usize,
    /// Tasks whose outputs were already up to date.
    pub skipped: usize,
    /// Tasks whose outputs were restored from the resource cache.
    pub cached: usize,
}

impl RunOutcome {
    pub fn is_ok(&self) -> bool {
        self.aborted.is_none() && !self.cancelled && self.results.iter().all(|r| r.ok)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.iter().filter(|r| !r.ok)
    }
}

enum Failure {
    Compile { line: u32, message: String },
    Fatal(anyhow::Error),
    Cancelled,
}

impl From<BuildError> for Failure {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Compile(e) => Failure::Compile {
                line: e.line,
                message: e.to_string(),
            },
            BuildError::Fatal(e) => Failure::Fatal(e),
            BuildError::Cancelled => Failure::Cancelled,
        }
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Failure::Fatal(err.into())
    }
}

enum Executed {
    Built,
    FromCache,
}

/// Drives the tasks of a [`TaskFactory`] to completion against a [`State`]
/// and a [`ResourceCache`]. Runs on the calling thread.
pub struct Engine<'a> {
    factory: &'a mut TaskFactory,
    state: &'a mut State,
    cache: &'a ResourceCache,
    cancel: &'a CancelToken,
    options: Arc<Options>,
}

impl<'a> Engine<'a> {
    pub fn new(
        factory: &'a mut TaskFactory,
        state: &'a mut State,
        cache: &'a ResourceCache,
        cancel: &'a CancelToken,
    ) -> Self {
        let options = factory.shared_options();
        Self {
            factory,
            state,
            cache,
            cancel,
            options,
        }
    }

    /// Runs every task created so far, and every task created along the way.
    pub fn run(mut self) -> RunOutcome {
        let s = Instant::now();
        let mut outcome = RunOutcome::default();

        let mut tasks: Vec<Arc<Task>> = self.factory.drain_new();
        let mut done: Vec<bool> = vec![false; tasks.len()];
        let mut completed = 0;

        let mut all_outputs: HashSet<Utf8PathBuf> = tasks
            .iter()
            .flat_map(|t| t.outputs().iter().map(|r| r.abs_path().to_owned()))
            .collect();
        let mut completed_outputs: HashSet<Utf8PathBuf> = HashSet::new();

        let pb_style = crate::utils::get_style_task().ok();

        'run: while completed < tasks.len() {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            outcome.passes += 1;
            let pending = tasks.len() - completed;
            let progress_before = completed;
            let mut task_failed = false;
            let mut available: Vec<Utf8PathBuf> = Vec::new();

            let pass = tracing::span!(Level::INFO, "pass", n = outcome.passes);
            if let Ok(style) = crate::utils::get_style_pass() {
                pass.pb_set_style(&style);
            }
            pass.pb_set_length(pending as u64);
            pass.pb_set_message(&format!("Pass {}", outcome.passes));
            let _enter = pass.enter();

            debug!("pass {} with {pending} pending task(s)", outcome.passes);

            for index in 0..tasks.len() {
                if done[index] {
                    continue;
                }

                if self.cancel.is_cancelled() {
                    outcome.cancelled = true;
                    break 'run;
                }

                let task = tasks[index].clone();

                let blocked = task.inputs().iter().any(|input| {
                    all_outputs.contains(input.abs_path())
                        && !completed_outputs.contains(input.abs_path())
                });
                if blocked {
                    continue;
                }

                done[index] = true;
                completed += 1;
                pass.pb_inc(1);

                let signature = match task.calculate_signature(&self.options) {
                    Ok(signature) => signature,
                    Err(e) => {
                        let failure = Failure::Fatal(anyhow::Error::new(e).context(format!(
                            "Couldn't compute signature of '{}'",
                            task.name()
                        )));
                        if self.record_failure(&task, failure, &mut outcome) {
                            break 'run;
                        }
                        continue;
                    }
                };

                if self.is_satisfied(&task, &signature) {
                    debug!("{} is up to date", task.name());
                    outcome.skipped += 1;
                    available.extend(task.outputs().iter().map(|r| r.abs_path().to_owned()));
                    continue;
                }

                let span = tracing::span!(Level::INFO, "task", name = task.name());
                if let Some(style) = &pb_style {
                    span.pb_set_style(style);
                }
                span.pb_set_message(&format!("Running {}", task.name()));
                let guard = span.enter();

                let result = self.execute(&task, &signature);
                drop(guard);

                match result {
                    Ok(executed) => {
                        if let Executed::FromCache = executed {
                            outcome.cached += 1;
                        }
                        outcome.results.push(TaskResult::ok(&task));
                        available.extend(task.outputs().iter().map(|r| r.abs_path().to_owned()));
                    }
                    Err(Failure::Cancelled) => {
                        self.invalidate(&task);
                        outcome.cancelled = true;
                        break 'run;
                    }
                    Err(failure) => {
                        task_failed = true;
                        if self.record_failure(&task, failure, &mut outcome) {
                            break 'run;
                        }
                    }
                }
            }

            completed_outputs.extend(available);

            if task_failed {
                break;
            }

            let fresh = self.factory.drain_new();
            if !fresh.is_empty() {
                debug!("discovered {} new task(s)", fresh.len());
            }
            let discovered = !fresh.is_empty();
            for task in fresh {
                all_outputs.extend(task.outputs().iter().map(|r| r.abs_path().to_owned()));
                tasks.push(task);
                done.push(false);
            }

            if completed == progress_before && !discovered {
                let blocked: Vec<Arc<Task>> = tasks
                    .iter()
                    .zip(&done)
                    .filter(|(_, done)| !**done)
                    .map(|(task, _)| task.clone())
                    .collect();

                let err = stall::diagnose(&blocked);
                error!("{err}");
                outcome.aborted = Some(err);
                break;
            }
        }

        info!(
            "Finished {} task(s) in {} pass(es), {} up to date, {} from cache {}",
            outcome.results.len(),
            outcome.passes,
            outcome.skipped,
            outcome.cached,
            crate::utils::as_overhead(s)
        );

        outcome
    }

    /// All outputs exist and carry the stored signature.
    fn is_satisfied(&self, task: &Task, signature: &Signature) -> bool {
        task.outputs().iter().all(|output| {
            output.exists() && self.state.get(output.abs_path()) == Some(signature)
        })
    }

    fn execute(&mut self, task: &Task, signature: &Signature) -> Result<Executed, Failure> {
        let outputs = task.outputs();
        let mut executed = Executed::Built;

        if task.is_cacheable() && self.cache.is_enabled() {
            let keys: Vec<CacheKey> = outputs
                .iter()
                .enumerate()
                .map(|(i, output)| CacheKey::calculate(task, &self.options, signature, i, output))
                .collect();

            match self.fetch_cached(task, &keys) {
                Some(contents) => {
                    debug!("{} restored from cache", task.name());
                    for (output, data) in outputs.iter().zip(contents) {
                        output.set_content(&data)?;
                    }
                    executed = Executed::FromCache;
                }
                None => {
                    self.invoke(task)?;
                    for (output, key) in outputs.iter().zip(&keys) {
                        if output.is_cacheable() && output.exists() {
                            let stored = output
                                .content()
                                .map_err(CacheError::from)
                                .and_then(|data| self.cache.put(key, &data));
                            if let Err(e) = stored {
                                warn!("Couldn't store '{output}' in the resource cache: {e}");
                            }
                        }
                    }
                }
            }
        } else {
            self.invoke(task)?;
        }

        for output in outputs {
            self.state.put(output.abs_path(), signature.clone());
        }

        if let Some(missing) = outputs.iter().find(|output| !output.exists()) {
            return Err(Failure::Compile {
                line: 0,
                message: format!("Output '{}' not found", missing.abs_path()),
            });
        }

        Ok(executed)
    }

    /// Contents of every output when all of them are cacheable and cached.
    /// Cache infrastructure errors count as a miss.
    fn fetch_cached(&self, task: &Task, keys: &[CacheKey]) -> Option<Vec<Vec<u8>>> {
        if !task.outputs().iter().all(|output| output.is_cacheable()) {
            return None;
        }

        let mut contents = Vec::with_capacity(keys.len());
        for key in keys {
            let data = self
                .cache
                .contains(key)
                .and_then(|found| if found { self.cache.get(key).map(Some) } else { Ok(None) });

            match data {
                Ok(Some(data)) => contents.push(data),
                Ok(None) => return None,
                Err(e) => {
                    warn!("Resource cache unavailable for {}: {e}", task.name());
                    return None;
                }
            }
        }

        Some(contents)
    }

    fn invoke(&mut self, task: &Task) -> Result<(), Failure> {
        debug!("building {}", task.name());
        let mut ctx = BuildContext {
            factory: &mut *self.factory,
            cancel: self.cancel,
        };

        let builder = task.builder().clone();
        match catch_unwind(AssertUnwindSafe(|| builder.build(task, &mut ctx))) {
            Ok(result) => result.map_err(Failure::from),
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Builder panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Builder panicked: {s}")
                } else {
                    String::from("Builder panicked with unknown payload")
                };

                Err(Failure::Fatal(anyhow::anyhow!(msg)))
            }
        }
    }

    fn invalidate(&mut self, task: &Task) {
        for output in task.outputs() {
            self.state.invalidate(output.abs_path());
        }
    }

    /// Records a failed task. Returns `true` when the run must stop now.
    fn record_failure(&mut self, task: &Task, failure: Failure, outcome: &mut RunOutcome) -> bool {
        self.invalidate(task);
        let result = TaskResult::ok(task);

        match failure {
            Failure::Compile { line, message } => {
                warn!("{} failed: {message}", task.name());
                outcome.results.push(result.fail(line, message));
                false
            }
            Failure::Fatal(cause) => {
                error!("{} failed unexpectedly: {cause:#}", task.name());
                let cause = Arc::new(cause);
                let mut result = result.fail(0, cause.to_string());
                result.cause = Some(cause.clone());
                outcome.results.push(result);
                outcome.aborted = Some(KilnError::Aborted {
                    task: task.name().to_string(),
                    cause,
                });
                true
            }
            Failure::Cancelled => {
                outcome.cancelled = true;
                true
            }
        }
    }
}
