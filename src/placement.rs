//! Thread-to-CPU placement.
//!
//! Threads are dealt round-robin across the utilized LLCs, filling cores
//! within an LLC before moving on and filling hardware threads within a core
//! up to the utilized count before advancing. Thread `t` lands in group
//! `t % num_groups`, where `num_groups` is the number of utilized LLCs; the
//! collaborative build/probe models rely on that congruence to rotate table
//! ownership.

use crate::error::{Error, Result};
use crate::topology::Topology;

/// One worker's assignment.
#[derive(Debug, Clone, Copy)]
pub struct Seat {
    /// LLC group, `tid % num_groups`.
    pub group: usize,
    /// OS CPU id to pin to.
    pub cpu_os_id: usize,
}

#[derive(Debug)]
pub struct Placement {
    pub seats: Vec<Seat>,
    /// Number of LLC groups (utilized LLCs).
    pub num_groups: usize,
    pub utilized_cpus_per_core: usize,
}

impl Placement {
    /// Assign `n` threads to CPUs.
    ///
    /// With `favor_physical_cores` set and enough physical cores for all
    /// threads, one hardware thread per core is used; otherwise sibling
    /// hardware threads are packed so the threads fit on as few LLCs as
    /// possible.
    pub fn new(topo: &Topology, n: usize, favor_physical_cores: bool) -> Result<Self> {
        if n == 0 {
            return Err(Error::NoThreads);
        }

        let cores_per_llc = topo.cores_per_llc();
        let mut cpus_per_core = topo.cpus_per_core();
        let mut cpus_per_llc = cores_per_llc * cpus_per_core;

        if favor_physical_cores && topo.num_cores() >= n {
            cpus_per_core = 1;
            cpus_per_llc = cores_per_llc;
        }

        let utilized_llcs = crate::div_ceil(n, cpus_per_llc);
        let utilizable_cores = utilized_llcs * cores_per_llc;
        let utilized_cpus_per_core = crate::div_ceil(n, utilizable_cores);

        if utilized_llcs > topo.num_llcs() || n > topo.num_cpus() {
            return Err(Error::TooManyThreads {
                requested: n,
                max: topo.num_llcs() * cores_per_llc * topo.cpus_per_core(),
                num_llcs: topo.num_llcs(),
                cores_per_llc,
                cpus_per_core: topo.cpus_per_core(),
            });
        }

        let mut seats = Vec::with_capacity(n);
        let mut llc = 0usize;
        let mut cores_on_llc = vec![0usize; utilized_llcs];
        let mut cpus_on_core = vec![0usize; topo.num_cores()];

        for _ in 0..n {
            let core_idx = topo.llcs[llc].cores[cores_on_llc[llc]];
            let core = &topo.cores[core_idx];
            let cpu_idx = core.cpus[cpus_on_core[core_idx]];
            cpus_on_core[core_idx] += 1;

            seats.push(Seat { group: llc, cpu_os_id: topo.cpus[cpu_idx].os_id });

            // Once a core carries its share of hardware threads, continue
            // with the next core on the same LLC.
            if cpus_on_core[core_idx] == utilized_cpus_per_core {
                cores_on_llc[llc] += 1;
            }
            llc = (llc + 1) % utilized_llcs;
        }

        Ok(Self { seats, num_groups: utilized_llcs, utilized_cpus_per_core })
    }
}

/// Split a relation of `size` tuples into `n` contiguous shares: each is
/// `size / n` tuples, the first `size % n` absorbing one extra. Returns
/// `(offset, len)` per thread; the shares tile `[0, size)` exactly.
pub fn split_shares(size: usize, n: usize) -> Vec<(usize, usize)> {
    let section = size / n;
    let remainder = size % n;
    let mut shares = Vec::with_capacity(n);
    let mut offset = 0;
    for t in 0..n {
        let len = section + (t < remainder) as usize;
        shares.push((offset, len));
        offset += len;
    }
    shares
}

/// Pin the calling thread to one OS CPU. Returns false if the kernel
/// rejected the mask (for instance a synthetic topology id on a smaller
/// host).
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu_os_id: usize) -> bool {
    // SAFETY: cpu_set_t is plain data; zeroed is a valid empty set, and
    // sched_setaffinity only reads the mask.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu_os_id, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu_os_id: usize) -> bool {
    false
}
