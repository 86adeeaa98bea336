//! Hardware topology: the LLC > physical core > hardware thread hierarchy,
//! plus last-level cache capacity and line size.
//!
//! The hierarchy is a tree with back-edges (a CPU knows its core, a core its
//! LLC). It is represented as three parallel arrays of plain records with
//! indices for the edges, giving O(1) navigation in both directions without
//! ownership cycles.
//!
//! [`Topology::discover`] reads Linux sysfs. [`Topology::uniform`] builds a
//! synthetic machine, which tests and benchmarks use to exercise multi-LLC
//! placement on any host.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// A last-level cache and the cores beneath it.
#[derive(Debug, Clone)]
pub struct Llc {
    /// Indices into [`Topology::cores`].
    pub cores: Vec<usize>,
}

/// A physical core and the hardware threads beneath it.
#[derive(Debug, Clone)]
pub struct Core {
    /// Index into [`Topology::llcs`].
    pub llc: usize,
    /// Indices into [`Topology::cpus`].
    pub cpus: Vec<usize>,
}

/// A hardware thread.
#[derive(Debug, Clone, Copy)]
pub struct Cpu {
    /// OS CPU id, as used by `sched_setaffinity`.
    pub os_id: usize,
    /// Index into [`Topology::cores`].
    pub core: usize,
    /// Index into [`Topology::llcs`].
    pub llc: usize,
}

#[derive(Debug, Clone)]
pub struct Topology {
    pub llcs: Vec<Llc>,
    pub cores: Vec<Core>,
    pub cpus: Vec<Cpu>,
    /// LLC capacity in bytes.
    pub llc_size: usize,
    /// Cache line size in bytes.
    pub line_size: usize,
}

impl Topology {
    /// Synthetic homogeneous machine: `num_llcs` LLCs, each with
    /// `cores_per_llc` cores of `cpus_per_core` hardware threads. OS CPU ids
    /// are assigned sequentially, LLC-major.
    pub fn uniform(
        num_llcs: usize,
        cores_per_llc: usize,
        cpus_per_core: usize,
        llc_size: usize,
        line_size: usize,
    ) -> Self {
        assert!(num_llcs > 0 && cores_per_llc > 0 && cpus_per_core > 0);

        let mut llcs = Vec::with_capacity(num_llcs);
        let mut cores = Vec::new();
        let mut cpus = Vec::new();

        for l in 0..num_llcs {
            let mut llc = Llc { cores: Vec::with_capacity(cores_per_llc) };
            for _ in 0..cores_per_llc {
                let core_idx = cores.len();
                let mut core = Core { llc: l, cpus: Vec::with_capacity(cpus_per_core) };
                for _ in 0..cpus_per_core {
                    let cpu_idx = cpus.len();
                    cpus.push(Cpu { os_id: cpu_idx, core: core_idx, llc: l });
                    core.cpus.push(cpu_idx);
                }
                llc.cores.push(core_idx);
                cores.push(core);
            }
            llcs.push(llc);
        }

        Self { llcs, cores, cpus, llc_size, line_size }
    }

    /// Discover the host topology from `/sys/devices/system/cpu`.
    pub fn discover() -> Result<Self> {
        Self::discover_at(Path::new("/sys/devices/system/cpu"))
    }

    fn discover_at(root: &Path) -> Result<Self> {
        let mut raw: Vec<RawCpu> = Vec::new();
        let mut llc_size = 0usize;
        let mut line_size = 0usize;

        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(os_id) = name.strip_prefix("cpu").and_then(|s| s.parse::<usize>().ok())
            else {
                continue;
            };

            let cpu_dir = entry.path();
            let pkg = read_usize(&cpu_dir.join("topology/physical_package_id")).unwrap_or(0);
            let core_id = read_usize(&cpu_dir.join("topology/core_id"))
                .ok_or_else(|| Error::Discovery(format!("cpu{os_id}: missing core_id")))?;

            let cache = deepest_cache(&cpu_dir.join("cache"))
                .ok_or_else(|| Error::Discovery(format!("cpu{os_id}: no unified cache")))?;
            llc_size = llc_size.max(cache.size);
            line_size = line_size.max(cache.line_size);

            raw.push(RawCpu { os_id, pkg, core_id, llc_key: cache.shared_list });
        }

        if raw.is_empty() {
            return Err(Error::Discovery(format!("no CPUs found under {}", root.display())));
        }
        if line_size == 0 {
            log::warn!("cache line size unknown, assuming 64 bytes");
            line_size = 64;
        }

        raw.sort_by_key(|c| c.os_id);
        Ok(Self::from_raw(&raw, llc_size, line_size))
    }

    fn from_raw(raw: &[RawCpu], llc_size: usize, line_size: usize) -> Self {
        let mut llcs: Vec<Llc> = Vec::new();
        let mut llc_keys: Vec<&str> = Vec::new();
        let mut cores: Vec<Core> = Vec::new();
        let mut core_keys: Vec<(usize, usize)> = Vec::new();
        let mut cpus: Vec<Cpu> = Vec::new();

        for c in raw {
            let llc = match llc_keys.iter().position(|k| *k == c.llc_key) {
                Some(i) => i,
                None => {
                    llc_keys.push(&c.llc_key);
                    llcs.push(Llc { cores: Vec::new() });
                    llcs.len() - 1
                }
            };

            let core_key = (c.pkg, c.core_id);
            let core = match core_keys.iter().position(|k| *k == core_key) {
                Some(i) => i,
                None => {
                    core_keys.push(core_key);
                    cores.push(Core { llc, cpus: Vec::new() });
                    llcs[llc].cores.push(cores.len() - 1);
                    cores.len() - 1
                }
            };

            let cpu_idx = cpus.len();
            cpus.push(Cpu { os_id: c.os_id, core, llc });
            cores[core].cpus.push(cpu_idx);
        }

        Self { llcs, cores, cpus, llc_size, line_size }
    }

    #[inline]
    pub fn num_llcs(&self) -> usize {
        self.llcs.len()
    }

    #[inline]
    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    #[inline]
    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Cores per LLC. On asymmetric machines, the minimum across LLCs.
    pub fn cores_per_llc(&self) -> usize {
        self.llcs.iter().map(|l| l.cores.len()).min().unwrap_or(0)
    }

    /// Hardware threads per core. On asymmetric machines, the minimum.
    pub fn cpus_per_core(&self) -> usize {
        self.cores.iter().map(|c| c.cpus.len()).min().unwrap_or(0)
    }
}

struct RawCpu {
    os_id: usize,
    pkg: usize,
    core_id: usize,
    llc_key: String,
}

struct CacheInfo {
    size: usize,
    line_size: usize,
    shared_list: String,
}

/// Walk `cache/index*` and return the deepest unified (or data) cache.
fn deepest_cache(cache_dir: &Path) -> Option<CacheInfo> {
    let mut best: Option<(usize, CacheInfo)> = None;

    let entries = fs::read_dir(cache_dir).ok()?;
    for entry in entries.flatten() {
        let dir = entry.path();
        if !entry.file_name().to_string_lossy().starts_with("index") {
            continue;
        }
        let kind = read_string(&dir.join("type")).unwrap_or_default();
        if kind != "Unified" && kind != "Data" {
            continue;
        }
        let level = read_usize(&dir.join("level"))?;
        if best.as_ref().is_some_and(|(l, _)| *l >= level) {
            continue;
        }

        let size = parse_size(&read_string(&dir.join("size"))?)?;
        let line_size = read_usize(&dir.join("coherency_line_size")).unwrap_or(0);
        let shared_list = read_string(&dir.join("shared_cpu_list"))?;
        best = Some((level, CacheInfo { size, line_size, shared_list }));
    }

    best.map(|(_, info)| info)
}

fn read_string(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_owned())
}

fn read_usize(path: &Path) -> Option<usize> {
    read_string(path)?.parse().ok()
}

/// Parse sysfs cache sizes like `32768K` or `36M`.
fn parse_size(s: &str) -> Option<usize> {
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, ""),
    };
    let n: usize = digits.parse().ok()?;
    match unit {
        "" => Some(n),
        "K" => Some(n * 1024),
        "M" => Some(n * 1024 * 1024),
        "G" => Some(n * 1024 * 1024 * 1024),
        _ => None,
    }
}
