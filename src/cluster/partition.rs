use super::topology::ProcessorSet;

/// One contiguous run of integration steps, owned by a single thread pinned to
/// `processor`.
///
/// Aligned to 128 bytes so neighbouring descriptors in a `Vec` never share a
/// cache line (two lines on parts with adjacent-line prefetch).
#[repr(align(128))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskDescriptor {
    /// Lower bound of the whole integration.
    pub base: f64,
    /// Width of one step.
    pub step_width: f64,
    /// Offset of this task's first step from `base`.
    pub start_step: u64,
    pub step_count: u64,
    /// Partial sum, written by the executing thread.
    pub accumulator: f64,
    pub processor: usize,
}

impl TaskDescriptor {
    /// `[start_step, start_step + step_count)`
    pub fn steps(&self) -> std::ops::Range<u64> {
        self.start_step..self.start_step + self.step_count
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("cannot place {0} tasks on an empty processor set")]
    EmptyProcessorSet(usize),
}

/// Splits `total_steps` steps into `task_count` tasks across `set`.
///
/// `min(|set|, task_count)` processors are used, walked in ascending id
/// order. Each takes `remaining_steps / remaining_cores` steps and
/// `remaining_tasks / remaining_cores` tasks, and shares its steps among its
/// tasks the same way. Remainders roll forward, so the step counts always sum
/// to `total_steps` and the ranges tile `[0, total_steps)` in order.
pub fn split(
    set: &ProcessorSet,
    task_count: usize,
    total_steps: u64,
    base: f64,
    step_width: f64,
) -> Result<Vec<TaskDescriptor>, PartitionError> {
    if task_count == 0 {
        return Ok(Vec::new());
    }
    if set.is_empty() {
        return Err(PartitionError::EmptyProcessorSet(task_count));
    }

    let mut cores_left = set.len().min(task_count);
    let mut tasks_left = task_count;
    let mut steps_left = total_steps;
    let mut cur_step = 0;
    let mut tasks = Vec::with_capacity(task_count);

    let mut cpu = set.next_after(None);
    while let (Some(processor), true) = (cpu, cores_left != 0) {
        let mut core_steps = steps_left / cores_left as u64;
        let mut core_tasks = tasks_left / cores_left;
        steps_left -= core_steps;
        tasks_left -= core_tasks;

        while core_tasks != 0 {
            let step_count = core_steps / core_tasks as u64;
            tasks.push(TaskDescriptor {
                base,
                step_width,
                start_step: cur_step,
                step_count,
                accumulator: 0.,
                processor,
            });
            cur_step += step_count;
            core_steps -= step_count;
            core_tasks -= 1;
        }

        cores_left -= 1;
        cpu = set.next_after(Some(processor));
    }

    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpus(ids: &[usize]) -> ProcessorSet {
        ids.iter().copied().collect()
    }

    fn layout(tasks: &[TaskDescriptor]) -> Vec<(usize, u64)> {
        tasks.iter().map(|t| (t.processor, t.step_count)).collect()
    }

    fn assert_tiles(tasks: &[TaskDescriptor], total_steps: u64) {
        let mut next = 0;
        for task in tasks {
            assert_eq!(task.start_step, next, "gap or overlap at {:?}", task);
            next = task.steps().end;
        }
        assert_eq!(next, total_steps);
        let covered: u64 = tasks.iter().map(|t| t.step_count).sum();
        assert_eq!(covered, total_steps);
    }

    #[test]
    fn cache_line_isolation() {
        assert!(std::mem::align_of::<TaskDescriptor>() >= 128);
        assert_eq!(std::mem::size_of::<TaskDescriptor>() % 128, 0);
    }

    #[test]
    fn one_task_per_core() {
        let tasks = split(&cpus(&[0, 2, 4, 6]), 4, 10, 1.5, 0.25).unwrap();
        let placed: Vec<_> = tasks
            .iter()
            .map(|t| (t.processor, t.start_step, t.step_count))
            .collect();
        assert_eq!(placed, vec![(0, 0, 2), (2, 2, 2), (4, 4, 3), (6, 7, 3)]);
        assert!(tasks.iter().all(|t| {
            t.base == 1.5 && t.step_width == 0.25 && t.accumulator == 0.
        }));
    }

    #[test]
    fn more_tasks_than_cores() {
        let tasks = split(&cpus(&[1, 3]), 5, 100, 0., 1.).unwrap();
        // core 1 takes 5/2 = 2 tasks and 50 steps, core 3 the remaining 3 tasks
        assert_eq!(
            layout(&tasks),
            vec![(1, 25), (1, 25), (3, 16), (3, 17), (3, 17)]
        );
        assert_tiles(&tasks, 100);
    }

    #[test]
    fn fewer_tasks_than_cores() {
        let set = cpus(&[0, 1, 2, 3, 4, 5, 6, 7]);
        let tasks = split(&set, 3, 7, 0., 1.).unwrap();
        assert_eq!(layout(&tasks), vec![(0, 2), (1, 2), (2, 3)]);
    }

    #[test]
    fn completeness_and_disjointness() {
        let set = cpus(&[0, 1, 5, 9, 12, 63, 64, 200]);
        for task_count in 1..=20 {
            let totals =
                [0, 1, 2, 7, 8, 19, 100, 1_000_003, u32::MAX as u64 + 17];
            for total_steps in totals {
                let tasks =
                    split(&set, task_count, total_steps, 0., 1.).unwrap();
                assert_eq!(tasks.len(), task_count);
                assert_tiles(&tasks, total_steps);
            }
        }
    }

    #[test]
    fn tasks_grouped_by_ascending_processor() {
        let set = cpus(&[7, 3, 11]);
        let tasks = split(&set, 7, 1000, 0., 1.).unwrap();
        let processors: Vec<_> = tasks.iter().map(|t| t.processor).collect();
        let mut sorted = processors.clone();
        sorted.sort();
        assert_eq!(processors, sorted);
        assert_eq!(processors, vec![3, 3, 7, 7, 11, 11, 11]);
    }

    #[test]
    fn empty_inputs() {
        assert!(split(&cpus(&[0]), 0, 10, 0., 1.).unwrap().is_empty());
        assert!(split(&ProcessorSet::new(), 0, 10, 0., 1.).unwrap().is_empty());
        let tasks = split(&cpus(&[0, 1]), 2, 0, 0., 1.).unwrap();
        assert!(tasks.iter().all(|t| t.step_count == 0));
        assert_eq!(
            split(&ProcessorSet::new(), 3, 10, 0., 1.),
            Err(PartitionError::EmptyProcessorSet(3))
        );
    }
}
