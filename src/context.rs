//! Join configuration, plan state, and the shared state workers coordinate
//! through: barriers, the radix plan, and the hash-table slots.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Barrier;

use crate::barrier::{StagedBarrier, StagedWaiter};
use crate::error::{Error, Result};
use crate::partition::BlockMap;
use crate::placement::Placement;
use crate::topology::Topology;
use crate::{lg_ceil, Bucket, SubRel};

/// Knobs supplied by the driver.
#[derive(Debug, Clone)]
pub struct JoinConfig {
    /// Worker thread count.
    pub threads: usize,
    /// User-supplied radix bits for R; latches the plan.
    pub radix_r: Option<u32>,
    /// User-supplied radix bits for S; latches the plan.
    pub radix_s: Option<u32>,
    /// Prefer one thread per physical core over packing sibling hardware
    /// threads onto fewer LLCs.
    pub favor_physical_cores: bool,
    /// Store keys in place of payloads and count only probes whose table
    /// cell equals the probed key.
    pub verify_keys: bool,
    /// Pin workers to their assigned CPUs. Disabled by tests that run
    /// synthetic topologies larger than the host.
    pub pin_threads: bool,
}

impl JoinConfig {
    pub fn new(threads: usize) -> Self {
        Self {
            threads,
            radix_r: None,
            radix_s: None,
            favor_physical_cores: true,
            verify_keys: false,
            pin_threads: true,
        }
    }

    /// Force both radices, latching the plan against skew rewrites.
    pub fn with_radix(mut self, bits: u32) -> Self {
        self.radix_r = Some(bits);
        self.radix_s = Some(bits);
        self
    }

    pub fn user_defined(&self) -> bool {
        self.radix_r.is_some() || self.radix_s.is_some()
    }
}

/// Which collaborative build/probe variant a plan maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    /// Single shared hash table over unpartitioned R.
    One,
    /// Per-LLC hash tables, symmetric partitioning, rotation across groups.
    Two,
    /// Single `|R|`-sized table filled from high-bit-partitioned R, probed
    /// by unpartitioned S.
    Three,
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Model::One => write!(f, "I"),
            Model::Two => write!(f, "II"),
            Model::Three => write!(f, "III"),
        }
    }
}

/// The radix plan plus the state the skew rendezvous mutates.
///
/// Only thread 0 writes the plan, and only between two staged-barrier
/// waits; all other accesses are reads on the far side of a barrier.
#[derive(Debug)]
pub struct PlanState {
    r_bits: AtomicU32,
    s_bits: AtomicU32,
    /// Radices came from the user; skew rewrites are disabled.
    pub user_defined: bool,
    /// Hash shift for R under model III: partitions on high key bits.
    model_iii_shift: AtomicU32,
    /// Latched once the skew rendezvous rewrites the plan.
    changed_radix_s: AtomicBool,
    /// Threads that observed heavy skew in their first S block.
    skew_reports: AtomicU32,
}

impl PlanState {
    fn new(r_bits: u32, s_bits: u32, user_defined: bool) -> Self {
        Self {
            r_bits: AtomicU32::new(r_bits),
            s_bits: AtomicU32::new(s_bits),
            user_defined,
            model_iii_shift: AtomicU32::new(0),
            changed_radix_s: AtomicBool::new(false),
            skew_reports: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn r_bits(&self) -> u32 {
        self.r_bits.load(Ordering::Acquire)
    }

    #[inline]
    pub fn s_bits(&self) -> u32 {
        self.s_bits.load(Ordering::Acquire)
    }

    #[inline]
    pub fn fanout_r(&self) -> u32 {
        1 << self.r_bits()
    }

    #[inline]
    pub fn mask_r(&self) -> u32 {
        self.fanout_r() - 1
    }

    pub fn model(&self) -> Model {
        let (r, s) = (self.r_bits(), self.s_bits());
        match (r, s) {
            (0, 0) => Model::One,
            (r, s) if r == s => Model::Two,
            (_, 0) => Model::Three,
            // Plan validation rejects every other shape at construction.
            _ => unreachable!("asymmetric radix plan ({r}, {s}) survived validation"),
        }
    }

    pub fn changed_radix_s(&self) -> bool {
        self.changed_radix_s.load(Ordering::Acquire)
    }

    /// Record one thread's heavy-skew observation; returns the total so far.
    pub fn report_skew(&self) -> u32 {
        self.skew_reports.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn skew_reports(&self) -> u32 {
        self.skew_reports.load(Ordering::SeqCst)
    }

    /// Demote to model III: S unpartitioned, R fanout doubled. Called by
    /// thread 0 between the two skew-rendezvous barriers.
    pub fn rewrite_to_global_table(&self) {
        let r = self.r_bits();
        self.changed_radix_s.store(true, Ordering::Release);
        self.s_bits.store(0, Ordering::Release);
        self.r_bits.store(r + 1, Ordering::Release);
    }

    pub fn set_model_iii_shift(&self, shift: u32) {
        self.model_iii_shift.store(shift, Ordering::Release);
    }

    pub fn model_iii_shift(&self) -> u32 {
        self.model_iii_shift.load(Ordering::Acquire)
    }
}

/// Hash-table slots shared across workers.
///
/// A slot holds a `Vec<Bucket>` behind an `UnsafeCell`. Leaders install and
/// discard tables while every other thread is parked at a barrier; during
/// build, concurrent writers touch provably disjoint cells. All the unsafe
/// is funneled through [`TableView`].
pub(crate) struct TableSlot {
    cell: UnsafeCell<Vec<Bucket>>,
}

// SAFETY: access is coordinated by the join's barrier protocol; see the
// struct docs and the call sites in `buildprobe`.
unsafe impl Sync for TableSlot {}

pub(crate) struct SharedTables {
    slots: Box<[TableSlot]>,
}

impl SharedTables {
    fn new(num_groups: usize) -> Self {
        let slots = (0..num_groups)
            .map(|_| TableSlot { cell: UnsafeCell::new(Vec::new()) })
            .collect();
        Self { slots }
    }

    /// Install a freshly allocated table into slot `g`.
    ///
    /// # Safety
    /// Caller must be the designated leader for `g`, with every other
    /// thread barred from the slot until a subsequent barrier.
    pub(crate) unsafe fn install(&self, g: usize, table: Vec<Bucket>) {
        unsafe { *self.slots[g].cell.get() = table };
    }

    /// Raw view of slot `g` for barrier-coordinated shared access.
    ///
    /// # Safety
    /// A table must have been installed in `g` on the near side of a
    /// barrier, and must not be discarded while the view is in use.
    pub(crate) unsafe fn view(&self, g: usize) -> TableView {
        let vec = unsafe { &mut *self.slots[g].cell.get() };
        TableView { ptr: vec.as_mut_ptr(), len: vec.len() }
    }

    /// Drop the table in slot `g`.
    ///
    /// # Safety
    /// Caller must be the designated leader for `g`, after a barrier has
    /// retired every outstanding view.
    pub(crate) unsafe fn discard(&self, g: usize) {
        unsafe { *self.slots[g].cell.get() = Vec::new() };
    }
}

/// Raw pointer view of one shared hash table.
///
/// The join's scatter phases write each cell from exactly one thread (keys
/// are unique primary keys and partitions are disjoint), and probes only
/// run on the far side of a barrier from the writes, so no per-cell
/// synchronization is needed.
#[derive(Copy, Clone)]
pub(crate) struct TableView {
    ptr: *mut Bucket,
    len: usize,
}

impl TableView {
    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    /// `idx < len`, and no other thread writes or reads this cell
    /// concurrently.
    #[inline(always)]
    pub(crate) unsafe fn write(&self, idx: usize, value: Bucket) {
        debug_assert!(idx < self.len);
        unsafe { *self.ptr.add(idx) = value };
    }

    /// # Safety
    /// `idx < len`, and no other thread writes this cell concurrently.
    #[inline(always)]
    pub(crate) unsafe fn read(&self, idx: usize) -> Bucket {
        debug_assert!(idx < self.len);
        unsafe { *self.ptr.add(idx) }
    }

    /// Zero `[start, end)`, the caller's first-touch share.
    ///
    /// # Safety
    /// The range must be in bounds and disjoint from every other thread's
    /// share.
    pub(crate) unsafe fn zero_range(&self, start: usize, end: usize) {
        debug_assert!(start <= end && end <= self.len);
        unsafe { std::ptr::write_bytes(self.ptr.add(start), 0, end - start) };
    }
}

/// Everything workers share for one join execution. Single-use: the plan
/// may be rewritten mid-stream, so a fresh context is built per run.
pub struct JoinContext {
    pub config: JoinConfig,
    pub topology: Topology,
    pub placement: Placement,
    pub plan: PlanState,
    pub rel_r_size: usize,
    pub rel_s_size: usize,
    pub barrier: Barrier,
    pub staged: StagedBarrier,
    pub(crate) tables: SharedTables,
}

impl JoinContext {
    /// Compute placement, select the radix plan from the relation sizes and
    /// LLC capacity, and validate it.
    pub fn new(
        topology: Topology,
        config: JoinConfig,
        rel_r_size: usize,
        rel_s_size: usize,
    ) -> Result<Self> {
        if rel_r_size == 0 || rel_r_size > u32::MAX as usize {
            return Err(Error::RelationTooLarge { rel: 'R', size: rel_r_size });
        }
        if rel_s_size > u32::MAX as usize {
            return Err(Error::RelationTooLarge { rel: 'S', size: rel_s_size });
        }

        let placement = Placement::new(&topology, config.threads, config.favor_physical_cores)?;

        let mut r_bits = config.radix_r.unwrap_or(0);
        let mut s_bits = config.radix_s.unwrap_or(0);

        // Auto plan: if R's table fits in the LLC with slack, run a single
        // shared table; otherwise pick a fanout whose per-partition table
        // fits in about two thirds of the LLC.
        if !config.user_defined() {
            let bucket = std::mem::size_of::<Bucket>();
            let table_bytes = bucket * rel_r_size;
            if table_bytes / (topology.llc_size * 6 / 5) >= 1 {
                let ratio = table_bytes / (topology.llc_size * 2 / 3);
                r_bits = lg_ceil(ratio as u32);
                s_bits = r_bits;
            }
        }

        validate_plan(r_bits, s_bits, placement.num_groups)?;

        let n = config.threads;
        Ok(Self {
            plan: PlanState::new(r_bits, s_bits, config.user_defined()),
            tables: SharedTables::new(placement.num_groups),
            barrier: Barrier::new(n),
            staged: StagedBarrier::new(n),
            config,
            topology,
            placement,
            rel_r_size,
            rel_s_size,
        })
    }

    #[inline]
    pub fn num_threads(&self) -> usize {
        self.config.threads
    }

    #[inline]
    pub fn num_groups(&self) -> usize {
        self.placement.num_groups
    }
}

/// Admissible plans: both sides unpartitioned, symmetric partitioning, or R
/// partitioned with S left whole. Partitioned fanouts must divide evenly
/// across the LLC groups so every group owns the same number of partitions
/// per iteration.
fn validate_plan(r_bits: u32, s_bits: u32, num_groups: usize) -> Result<()> {
    if s_bits > 0 && s_bits != r_bits {
        return Err(Error::AsymmetricPlan { r_bits, s_bits });
    }
    for (rel, bits) in [('R', r_bits), ('S', s_bits)] {
        let fanout = 1u32 << bits;
        if bits > 0 && fanout as usize % num_groups != 0 {
            return Err(Error::PlanIndivisible { rel, fanout, num_groups });
        }
    }
    // A skew rewrite doubles R's fanout, which preserves divisibility, so
    // no separate check is needed for the demoted plan.
    Ok(())
}

/// Per-worker state: thread ids, the thread's sub-relations and partition
/// maps, its staged-barrier handle, and its slice of the join result.
pub struct Worker<'ctx> {
    pub ctx: &'ctx JoinContext,
    pub tid: usize,
    pub group: usize,
    pub sub_r: SubRel,
    pub sub_s: SubRel,
    pub blocks_r: BlockMap,
    pub blocks_s: BlockMap,
    pub staged: StagedWaiter<'ctx>,
    pub matches: u64,
    pub checksum: u64,
}

/// The reduced result of one join execution, along with the plan that
/// actually ran (skew demotion is observable here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinStats {
    pub matches: u64,
    pub checksum: u64,
    pub r_bits: u32,
    pub s_bits: u32,
    pub model: Model,
}
