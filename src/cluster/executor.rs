use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use tracing::{debug, trace, warn};

use super::{
    affinity::{pin_current_thread, AffinityGuard},
    partition::{split, PartitionError, TaskDescriptor},
    topology::ProcessorSet,
};

/// Steps between two polls of the abort flag.
const ABORT_POLL_STEPS: u64 = 1 << 16;

type TaskHandle = (usize, JoinHandle<Result<TaskDescriptor, ExecError>>);

/// The function being integrated. Both ends of a network round must agree on
/// it; it does not travel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Integrand {
    /// `f(x) = x`
    Identity,
    /// `f(x) = 2 / (1 + x²)`, whose integral over `[0, ∞)` is π.
    #[default]
    Arctan,
}

impl Integrand {
    #[inline(always)]
    pub fn eval(self, x: f64) -> f64 {
        match self {
            Integrand::Identity => x,
            Integrand::Arctan => 2. / (1. + x * x),
        }
    }
}

impl std::str::FromStr for Integrand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" | "x" => Ok(Integrand::Identity),
            "arctan" => Ok(Integrand::Arctan),
            other => Err(format!("unknown integrand {:?}", other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error("asked to run with zero threads")]
    NoThreads,
    #[error("failed to pin thread to cpu {cpu}: {source}")]
    Affinity { cpu: usize, source: io::Error },
    #[error("failed to spawn thread for cpu {cpu}: {source}")]
    Spawn { cpu: usize, source: io::Error },
    #[error("thread on cpu {0} panicked")]
    Panicked(usize),
    #[error("round aborted")]
    Aborted,
}

/// Runs one integration round on pinned OS threads.
///
/// An executor is round-scoped: once its abort flag is raised every later
/// round fails with [`ExecError::Aborted`].
#[derive(Debug, Clone, Default)]
pub struct Executor {
    integrand: Integrand,
    abort: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(integrand: Integrand) -> Self {
        Self {
            integrand,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares `abort` with the caller, who may raise it to stop the round.
    pub fn with_abort(integrand: Integrand, abort: Arc<AtomicBool>) -> Self {
        Self { integrand, abort }
    }

    /// One thread per processor in `set`.
    pub fn run_local(
        &self,
        set: &ProcessorSet,
        total_steps: u64,
        base: f64,
        step_width: f64,
    ) -> Result<f64, ExecError> {
        let tasks = split(set, set.len(), total_steps, base, step_width)?;
        self.run(tasks, Vec::new())
    }

    /// `threads` threads over `set`. Processors left without a thread get
    /// filler work of the same per-thread size, so that every core in `set`
    /// is busy and turbo frequencies stay comparable between runs. Filler
    /// results are thrown away.
    pub fn run_local_scalable(
        &self,
        threads: usize,
        set: &ProcessorSet,
        total_steps: u64,
        base: f64,
        step_width: f64,
    ) -> Result<f64, ExecError> {
        let tasks = split(set, threads, total_steps, base, step_width)?;

        let mut filler = Vec::new();
        if set.len() > threads && threads != 0 {
            let idle_threads = set.len() - threads;
            let used: ProcessorSet =
                tasks.iter().map(|t| t.processor).collect();
            let idle = set.difference(&used);
            let filler_steps =
                (total_steps / threads as u64) * idle_threads as u64;
            filler =
                split(&idle, idle_threads, filler_steps, base, step_width)?;
            debug!(idle = %idle, filler_steps, "occupying idle processors");
        }

        self.run(tasks, filler)
    }

    fn run(
        &self,
        mut tasks: Vec<TaskDescriptor>,
        filler: Vec<TaskDescriptor>,
    ) -> Result<f64, ExecError> {
        let first = match tasks.first() {
            Some(first) => *first,
            None => return Err(ExecError::NoThreads),
        };
        if self.abort.load(Ordering::Relaxed) {
            return Err(ExecError::Aborted);
        }

        // move ourselves off whatever core we were on before anyone spawns
        let _guard = AffinityGuard::pin(first.processor).map_err(|source| {
            ExecError::Affinity {
                cpu: first.processor,
                source,
            }
        })?;

        let mut filler_handles = Vec::with_capacity(filler.len());
        let mut handles = Vec::with_capacity(tasks.len().saturating_sub(1));

        let spawned =
            self.spawn_all(filler, &mut filler_handles).and_then(|()| {
                self.spawn_all(tasks[1..].iter().copied(), &mut handles)
            });
        if let Err(e) = spawned {
            warn!("{}, aborting round", e);
            self.abort.store(true, Ordering::Relaxed);
            let _ = join_all(filler_handles);
            let _ = join_all(handles);
            return Err(e);
        }

        let own = integrate(first, self.integrand, &self.abort);

        // fillers first, then the real tasks in order
        let filler_done = join_all(filler_handles);
        let rest = join_all(handles);
        filler_done?;
        tasks[0] = own?;
        for (slot, done) in tasks[1..].iter_mut().zip(rest?) {
            *slot = done;
        }

        // processor order, then task order within a processor
        Ok(tasks.iter().map(|t| t.accumulator).sum())
    }

    fn spawn_all(
        &self,
        tasks: impl IntoIterator<Item = TaskDescriptor>,
        handles: &mut Vec<TaskHandle>,
    ) -> Result<(), ExecError> {
        for task in tasks {
            handles.push(self.spawn(task)?);
        }
        Ok(())
    }

    fn spawn(&self, task: TaskDescriptor) -> Result<TaskHandle, ExecError> {
        let integrand = self.integrand;
        let abort = self.abort.clone();
        let cpu = task.processor;
        trace!(
            cpu,
            start = task.start_step,
            steps = task.step_count,
            "spawning task"
        );
        thread::Builder::new()
            .name(format!("quadra-cpu{}", cpu))
            .spawn(move || {
                pin_current_thread(cpu)
                    .map_err(|source| ExecError::Affinity { cpu, source })?;
                integrate(task, integrand, &abort)
            })
            .map(|handle| (cpu, handle))
            .map_err(|source| ExecError::Spawn { cpu, source })
    }
}

/// Joins every handle, keeping completed descriptors in spawn order. The
/// first failure is reported but every thread is still joined.
fn join_all(
    handles: Vec<TaskHandle>,
) -> Result<Vec<TaskDescriptor>, ExecError> {
    let mut done = Vec::with_capacity(handles.len());
    let mut first_err = None;
    for (cpu, handle) in handles {
        match handle.join() {
            Ok(Ok(task)) => done.push(task),
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
            }
            Err(_) => {
                first_err.get_or_insert(ExecError::Panicked(cpu));
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(done),
    }
}

/// The integration kernel: left Riemann sum over the task's steps.
pub fn integrate(
    mut task: TaskDescriptor,
    integrand: Integrand,
    abort: &AtomicBool,
) -> Result<TaskDescriptor, ExecError> {
    let base = task.base;
    let width = task.step_width;
    let end = task.start_step + task.step_count;
    let mut sum = 0f64;
    let mut step = task.start_step;
    while step < end {
        let chunk_end = end.min(step + ABORT_POLL_STEPS);
        for i in step..chunk_end {
            let x = base + i as f64 * width;
            sum += integrand.eval(x) * width;
        }
        step = chunk_end;
        if abort.load(Ordering::Relaxed) {
            return Err(ExecError::Aborted);
        }
    }
    task.accumulator = sum;
    trace!(
        cpu = task.processor,
        from = base + task.start_step as f64 * width,
        to = base + end as f64 * width,
        sum,
        "task done"
    );
    Ok(task)
}

/// [`Executor::run_local`] with the default integrand.
pub fn run_local(
    set: &ProcessorSet,
    total_steps: u64,
    base: f64,
    step_width: f64,
) -> Result<f64, ExecError> {
    Executor::default().run_local(set, total_steps, base, step_width)
}

/// [`Executor::run_local_scalable`] with the default integrand.
pub fn run_local_scalable(
    threads: usize,
    set: &ProcessorSet,
    total_steps: u64,
    base: f64,
    step_width: f64,
) -> Result<f64, ExecError> {
    Executor::default().run_local_scalable(
        threads,
        set,
        total_steps,
        base,
        step_width,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::affinity::thread_affinity;

    fn usable(max: usize) -> ProcessorSet {
        let allowed = thread_affinity().unwrap();
        if allowed.is_empty() {
            // no affinity support on this target, pinning is a no-op
            (0..max).collect()
        } else {
            allowed.iter().take(max).collect()
        }
    }

    const TO: f64 = 50000.;

    #[test]
    fn kernel_matches_naive_sum() {
        let task = TaskDescriptor {
            base: 1.,
            step_width: 0.5,
            start_step: 2,
            step_count: 3,
            accumulator: 0.,
            processor: 0,
        };
        let abort = AtomicBool::new(false);
        let done = integrate(task, Integrand::Identity, &abort).unwrap();
        // x = 2.0, 2.5, 3.0
        assert_eq!(done.accumulator, (2. + 2.5 + 3.) * 0.5);
    }

    #[test]
    fn kernel_honours_abort() {
        let task = TaskDescriptor {
            base: 0.,
            step_width: 1.,
            start_step: 0,
            step_count: ABORT_POLL_STEPS * 4,
            accumulator: 0.,
            processor: 0,
        };
        assert!(matches!(
            integrate(task, Integrand::Identity, &AtomicBool::new(true)),
            Err(ExecError::Aborted)
        ));
    }

    #[test]
    fn split_then_reduce_preserves_value() {
        let set = usable(8);
        let width = 1. / 50.;
        let steps = (TO / width) as u64;
        let exec = Executor::new(Integrand::Arctan);
        let one = exec.run_local_scalable(1, &set, steps, 0., width).unwrap();
        let eight = exec.run_local_scalable(8, &set, steps, 0., width).unwrap();
        assert!(((one - eight) / one).abs() < 1e-9, "{} vs {}", one, eight);
        // ∫0..50000 2/(1+x²) = 2·atan(50000), a left sum overshoots by ~width
        let exact = 2. * TO.atan();
        assert!(((one - exact) / exact).abs() < 1e-2, "{} vs {}", one, exact);
    }

    #[test]
    #[ignore = "2.5e9 steps, run with --ignored in release mode"]
    fn split_then_reduce_full_scale() {
        let set = usable(8);
        let width = 1. / TO;
        let steps = (TO / width) as u64;
        let exec = Executor::new(Integrand::Arctan);
        let one = exec.run_local_scalable(1, &set, steps, 0., width).unwrap();
        let eight = exec.run_local_scalable(8, &set, steps, 0., width).unwrap();
        assert!(((one - eight) / one).abs() < 1e-9, "{} vs {}", one, eight);
    }

    #[test]
    fn reduction_is_deterministic() {
        let set = usable(4);
        let exec = Executor::new(Integrand::Arctan);
        let a = exec.run_local_scalable(6, &set, 3_000_001, 0., 1e-4).unwrap();
        let b = exec.run_local_scalable(6, &set, 3_000_001, 0., 1e-4).unwrap();
        assert_eq!(a.to_bits(), b.to_bits());
        let c = exec.run_local(&set, 3_000_001, 0., 1e-4).unwrap();
        let d = exec.run_local(&set, 3_000_001, 0., 1e-4).unwrap();
        assert_eq!(c.to_bits(), d.to_bits());
    }

    #[test]
    fn filler_does_not_leak_into_result() {
        let set = usable(4);
        let exec = Executor::new(Integrand::Identity);
        // ∫0..1 x dx with 1000 steps: left sum = (n-1)/(2n)
        let got = exec.run_local_scalable(1, &set, 1000, 0., 1e-3).unwrap();
        assert!((got - 0.4995).abs() < 1e-9, "{}", got);
    }

    #[test]
    fn restores_caller_affinity() {
        let before = thread_affinity().unwrap();
        run_local(&usable(2), 10_000, 0., 1e-4).unwrap();
        assert_eq!(thread_affinity().unwrap(), before);
    }

    #[test]
    fn zero_steps_is_zero() {
        assert_eq!(run_local(&usable(2), 0, 0., 1.).unwrap(), 0.);
    }

    #[test]
    fn rejects_degenerate_rounds() {
        assert!(matches!(
            run_local(&ProcessorSet::new(), 10, 0., 1.),
            Err(ExecError::NoThreads)
        ));
        assert!(matches!(
            run_local_scalable(0, &usable(2), 10, 0., 1.),
            Err(ExecError::NoThreads)
        ));
        assert!(matches!(
            run_local_scalable(2, &ProcessorSet::new(), 10, 0., 1.),
            Err(ExecError::Partition(PartitionError::EmptyProcessorSet(2)))
        ));
    }

    #[test]
    fn aborted_executor_refuses_work() {
        let abort = Arc::new(AtomicBool::new(true));
        let exec = Executor::with_abort(Integrand::Arctan, abort);
        assert!(matches!(
            exec.run_local(&usable(2), 10, 0., 1.),
            Err(ExecError::Aborted)
        ));
    }
}
