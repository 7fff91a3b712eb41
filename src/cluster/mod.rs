pub mod affinity;
pub mod executor;
#[cfg(feature = "net")]
pub mod net;
pub mod partition;
pub mod topology;

// A round of integration is split twice. The starter divides the total number
// of steps between workers in proportion to the speed each of them reports,
// and every worker divides its share again between its own cores. Both splits
// hand out contiguous runs of steps, so a share is fully described by a start
// step and a count and nothing but four numbers ever crosses the wire.

// Local execution uses plain OS threads, one per task, each pinned to its
// processor before it touches the task. Threads live for one round only, and
// there is no pool to keep warm since spawning is noise next to a round.
// The calling thread pins itself to the first task's processor and does that
// task itself. Partial sums are added in processor order, then task order, so
// the same split always yields the same bits.

// The network side is async. A worker parks on a UDP socket until a broadcast
// names a starter, connects back, reports its speed and then waits for its
// share. While the share is being computed on blocking threads, a watchdog owns
// the read half of the connection. The starter never writes during that time,
// so any activity the watchdog sees means the round is dead, and it raises the
// executor's abort flag. Compute threads check that
// flag between chunks of steps and bail out.

pub use executor::{
    run_local, run_local_scalable, ExecError, Executor, Integrand,
};
pub use partition::{split, PartitionError, TaskDescriptor};
pub use topology::{CpuTopology, ProcessorSet};
