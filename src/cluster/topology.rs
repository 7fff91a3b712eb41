use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use hashbrown::HashSet;
use tracing::{debug, trace};

use super::affinity;

/// Upper bound on logical processor ids, same as glibc's `CPU_SETSIZE`.
pub const MAX_PROCESSORS: usize = 1024;

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = MAX_PROCESSORS / WORD_BITS;

const SYSFS_CPU_DEVICES: &str = "/sys/bus/cpu/devices";

/// A set of logical processor ids.
///
/// Backed by a fixed bitset so membership and size are O(1) and walking the
/// set in ascending order only touches non-empty words.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ProcessorSet {
    words: [u64; WORDS],
    len: usize,
}

impl ProcessorSet {
    pub fn new() -> Self {
        Self {
            words: [0; WORDS],
            len: 0,
        }
    }

    /// Inserts `cpu`, returning false if it was already present or is out of
    /// range.
    pub fn insert(&mut self, cpu: usize) -> bool {
        if cpu >= MAX_PROCESSORS || self.contains(cpu) {
            return false;
        }
        self.words[cpu / WORD_BITS] |= 1 << (cpu % WORD_BITS);
        self.len += 1;
        true
    }

    pub fn remove(&mut self, cpu: usize) -> bool {
        if !self.contains(cpu) {
            return false;
        }
        self.words[cpu / WORD_BITS] &= !(1 << (cpu % WORD_BITS));
        self.len -= 1;
        true
    }

    pub fn contains(&self, cpu: usize) -> bool {
        cpu < MAX_PROCESSORS
            && self.words[cpu / WORD_BITS] & (1 << (cpu % WORD_BITS)) != 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Smallest member `>= from`, if any.
    pub fn first_at_or_after(&self, from: usize) -> Option<usize> {
        if from >= MAX_PROCESSORS {
            return None;
        }
        let mut word_idx = from / WORD_BITS;
        let mut word = self.words[word_idx] & (!0u64 << (from % WORD_BITS));
        loop {
            if word != 0 {
                let bit = word.trailing_zeros() as usize;
                return Some(word_idx * WORD_BITS + bit);
            }
            word_idx += 1;
            if word_idx == WORDS {
                return None;
            }
            word = self.words[word_idx];
        }
    }

    /// The next member after `cpu`, wrapping around to the smallest member.
    /// `None` only for an empty set.
    pub fn next_after(&self, cpu: Option<usize>) -> Option<usize> {
        let from = cpu.map_or(0, |cpu| cpu + 1);
        self.first_at_or_after(from)
            .or_else(|| self.first_at_or_after(0))
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            set: self,
            next: 0,
        }
    }

    /// Members of `self` that are not in `other`.
    pub fn difference(&self, other: &ProcessorSet) -> ProcessorSet {
        let mut out = self.clone();
        for cpu in other.iter() {
            out.remove(cpu);
        }
        out
    }

    pub fn intersection(&self, other: &ProcessorSet) -> ProcessorSet {
        self.iter().filter(|cpu| other.contains(*cpu)).collect()
    }
}

impl Default for ProcessorSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<usize> for ProcessorSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = ProcessorSet::new();
        for cpu in iter {
            set.insert(cpu);
        }
        set
    }
}

pub struct Iter<'a> {
    set: &'a ProcessorSet,
    next: usize,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let cpu = self.set.first_at_or_after(self.next)?;
        self.next = cpu + 1;
        Some(cpu)
    }
}

impl<'a> IntoIterator for &'a ProcessorSet {
    type Item = usize;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

impl fmt::Display for ProcessorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, cpu) in self.iter().enumerate() {
            if i != 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", cpu)?;
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for ProcessorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessorSet{}", self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("{path} does not hold an integer: {content:?}")]
    Parse { path: PathBuf, content: String },
    #[error("no cpus found under {0}")]
    NoCpus(PathBuf),
}

/// Where a logical processor sits in the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    pub cpu_id: usize,
    pub core_id: usize,
    pub package_id: usize,
}

/// Logical processors of this machine, as reported by sysfs.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    cpus: Vec<CpuInfo>,
    max_package_id: usize,
    max_core_id: usize,
    max_cpu_id: usize,
}

impl CpuTopology {
    /// Reads the topology of the running machine.
    pub fn probe() -> Result<Self, TopologyError> {
        Self::probe_at(SYSFS_CPU_DEVICES)
    }

    /// Reads a sysfs-shaped tree:
    /// `<root>/cpuN/topology/{core_id,physical_package_id}`.
    pub fn probe_at(root: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let root = root.as_ref();
        let entries = fs::read_dir(root).map_err(|source| TopologyError::Read {
            path: root.to_path_buf(),
            source,
        })?;

        let mut cpus = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| TopologyError::Read {
                path: root.to_path_buf(),
                source,
            })?;
            let name = entry.file_name();
            let cpu_id = match name
                .to_str()
                .and_then(|name| name.strip_prefix("cpu"))
                .and_then(|id| id.parse::<usize>().ok())
            {
                Some(id) => id,
                None => continue,
            };
            let topology = entry.path().join("topology");
            let core_id = read_id(&topology.join("core_id"))?;
            let package_id = read_id(&topology.join("physical_package_id"))?;
            trace!(cpu_id, core_id, package_id, "probed cpu");
            cpus.push(CpuInfo {
                cpu_id,
                core_id,
                package_id,
            });
        }

        if cpus.is_empty() {
            return Err(TopologyError::NoCpus(root.to_path_buf()));
        }
        Ok(Self::from_cpus(cpus))
    }

    pub fn from_cpus(mut cpus: Vec<CpuInfo>) -> Self {
        cpus.sort_by_key(|cpu| cpu.cpu_id);
        let max_package_id =
            cpus.iter().map(|c| c.package_id).max().unwrap_or(0);
        let max_core_id = cpus.iter().map(|c| c.core_id).max().unwrap_or(0);
        let max_cpu_id = cpus.iter().map(|c| c.cpu_id).max().unwrap_or(0);
        Self {
            cpus,
            max_package_id,
            max_core_id,
            max_cpu_id,
        }
    }

    pub fn cpus(&self) -> &[CpuInfo] {
        &self.cpus
    }

    pub fn max_package_id(&self) -> usize {
        self.max_package_id
    }

    pub fn max_core_id(&self) -> usize {
        self.max_core_id
    }

    pub fn max_cpu_id(&self) -> usize {
        self.max_cpu_id
    }

    /// Every logical processor.
    pub fn all(&self) -> ProcessorSet {
        self.cpus.iter().map(|cpu| cpu.cpu_id).collect()
    }

    /// One logical processor per physical core: the lowest cpu id of each
    /// distinct (package, core) pair. Hyperthread siblings are left out.
    pub fn single_per_core(&self) -> ProcessorSet {
        let mut seen = HashSet::new();
        let mut set = ProcessorSet::new();
        // cpus are sorted by id, so the first sibling seen is the lowest
        for cpu in &self.cpus {
            if seen.insert((cpu.package_id, cpu.core_id)) {
                set.insert(cpu.cpu_id);
            }
        }
        set
    }

    /// `single_per_core` restricted to the cpus this process may run on.
    pub fn usable(&self) -> ProcessorSet {
        restrict_to_affinity(self.single_per_core())
    }

    /// `all` restricted to the cpus this process may run on.
    pub fn usable_all(&self) -> ProcessorSet {
        restrict_to_affinity(self.all())
    }
}

fn restrict_to_affinity(set: ProcessorSet) -> ProcessorSet {
    match affinity::process_affinity() {
        Ok(allowed) if !allowed.is_empty() => {
            let restricted = set.intersection(&allowed);
            if restricted.len() != set.len() {
                debug!(
                    %set,
                    %allowed,
                    "restricting processor set to affinity mask"
                );
            }
            restricted
        }
        _ => set,
    }
}

fn read_id(path: &Path) -> Result<usize, TopologyError> {
    let content =
        fs::read_to_string(path).map_err(|source| TopologyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    content
        .trim()
        .parse()
        .map_err(|_| TopologyError::Parse {
            path: path.to_path_buf(),
            content,
        })
}

impl fmt::Display for CpuTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- cpu topology ---")?;
        writeln!(f, "max_package_id: {:3}", self.max_package_id)?;
        writeln!(f, "max_core_id:    {:3}", self.max_core_id)?;
        writeln!(f, "max_cpu_id:     {:3}", self.max_cpu_id)?;
        for cpu in &self.cpus {
            writeln!(
                f,
                "cpu[{}]: package_id: {:3} core_id: {:3}",
                cpu.cpu_id, cpu.package_id, cpu.core_id
            )?;
        }
        write!(f, "--- /cpu topology ---")
    }
}
