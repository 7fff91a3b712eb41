//! Binding threads to logical processors.
//!
//! Linux only; on other targets pinning is a no-op and the affinity mask is
//! reported as empty (unknown).

use std::io;

use tracing::trace;

use super::topology::ProcessorSet;

/// Pins the calling thread to `cpu`.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> io::Result<()> {
    trace!(cpu, "pinning thread");
    let set: ProcessorSet = std::iter::once(cpu).collect();
    if set.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cpu {} is out of range", cpu),
        ));
    }
    set_thread_affinity(&set)
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(cpu: usize) -> io::Result<()> {
    trace!(cpu, "thread pinning unsupported on this target");
    Ok(())
}

/// Processors the calling thread may currently run on.
#[cfg(target_os = "linux")]
pub fn thread_affinity() -> io::Result<ProcessorSet> {
    // SAFETY: cpu_set_t is a plain bitmask, all-zeroes is valid.
    let mut raw: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    // SAFETY: pid 0 is the calling thread; the size matches the buffer.
    let size = std::mem::size_of::<libc::cpu_set_t>();
    let res = unsafe { libc::sched_getaffinity(0, size, &mut raw) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    let max = (libc::CPU_SETSIZE as usize).min(super::topology::MAX_PROCESSORS);
    // SAFETY: CPU_ISSET only reads the mask within CPU_SETSIZE.
    Ok((0..max).filter(|cpu| unsafe { libc::CPU_ISSET(*cpu, &raw) }).collect())
}

#[cfg(not(target_os = "linux"))]
pub fn thread_affinity() -> io::Result<ProcessorSet> {
    Ok(ProcessorSet::new())
}

/// Processors this process may run on. Same as the main thread's mask at
/// startup; used to keep probed sets inside cgroup/taskset restrictions.
pub fn process_affinity() -> io::Result<ProcessorSet> {
    thread_affinity()
}

#[cfg(target_os = "linux")]
fn set_thread_affinity(set: &ProcessorSet) -> io::Result<()> {
    // SAFETY: cpu_set_t is a plain bitmask, all-zeroes is valid.
    let mut raw: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for cpu in set {
        // SAFETY: ProcessorSet ids are below MAX_PROCESSORS == CPU_SETSIZE.
        unsafe { libc::CPU_SET(cpu, &mut raw) };
    }
    // SAFETY: pid 0 is the calling thread; the size matches the buffer.
    let size = std::mem::size_of::<libc::cpu_set_t>();
    let res = unsafe { libc::sched_setaffinity(0, size, &raw) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Restores the calling thread's affinity mask on drop.
///
/// Must be dropped on the thread that created it.
pub struct AffinityGuard {
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    saved: Option<ProcessorSet>,
}

impl AffinityGuard {
    /// Saves the current mask, then pins the calling thread to `cpu`.
    pub fn pin(cpu: usize) -> io::Result<Self> {
        let saved = thread_affinity().ok().filter(|set| !set.is_empty());
        pin_current_thread(cpu)?;
        Ok(Self { saved })
    }
}

impl Drop for AffinityGuard {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        if let Some(saved) = &self.saved {
            if let Err(e) = set_thread_affinity(saved) {
                tracing::warn!("failed to restore thread affinity: {}", e);
            }
        }
    }
}
