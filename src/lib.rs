pub mod cluster;
pub mod config;

pub use cluster::{CpuTopology, Executor, Integrand, ProcessorSet};
pub use config::ClusterConfig;
