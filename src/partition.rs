//! In-place cache-aware radix partitioning.
//!
//! Reorders a thread's sub-relation into radix partitions block by block:
//! each block of at most [`CHUNK_SIZE`] tuples is histogrammed, prefix-
//! summed, and scattered into the slot vacated by the previous block. The
//! first block is spilled to a scratch buffer and copied back into the
//! trailing slot afterwards, which is what makes the whole pass in-place.
//!
//! Each block is described to the build/probe phase by `num_groups`
//! sub-blocks, one per LLC group, so that the groups can sweep disjoint
//! partition ranges of every block in parallel.
//!
//! While partitioning the first block of S, all threads rendezvous to vote
//! on observed skew; a unanimous vote rewrites the plan to an unpartitioned
//! S with a doubled R fanout, and partitioning restarts under the new plan.

use log::info;

use crate::barrier::StagedWaiter;
use crate::context::JoinContext;
use crate::{div_ceil, lg_ceil, radix_hash, RelId, SubRel, Tuple};

/// Upper bound on tuples per block. Keeps a block's scratch plus histogram
/// comfortably inside L1/L2 and lets histogram counters stay 16-bit.
pub const CHUNK_SIZE: usize = (1 << 15) - 10;

type Counter = u16;

/// One sub-block's tuple range within the sub-relation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

/// The `(block x sub_block)` position matrix a partitioning pass hands to
/// build/probe, plus the per-sub-block sweep cursors.
///
/// Spans are immutable partition layout; cursors are iteration state that
/// the owning thread advances during its build and probe sweeps. They live
/// in parallel arrays so the layout can be consulted after sweeps consumed
/// the cursors.
#[derive(Debug, Default)]
pub struct BlockMap {
    num_blocks: usize,
    num_sub_blocks: usize,
    spans: Vec<Span>,
    cursors: Vec<u32>,
}

impl BlockMap {
    pub fn empty() -> Self {
        Self::default()
    }

    fn new(num_blocks: usize, num_sub_blocks: usize) -> Self {
        Self {
            num_blocks,
            num_sub_blocks,
            spans: vec![Span::default(); num_blocks * num_sub_blocks],
            cursors: vec![0; num_blocks * num_sub_blocks],
        }
    }

    #[inline(always)]
    fn idx(&self, block: usize, sub_block: usize) -> usize {
        debug_assert!(block < self.num_blocks && sub_block < self.num_sub_blocks);
        block * self.num_sub_blocks + sub_block
    }

    fn set_span(&mut self, block: usize, sub_block: usize, start: u32, end: u32) {
        let i = self.idx(block, sub_block);
        self.spans[i] = Span { start, end };
        self.cursors[i] = start;
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    #[inline]
    pub fn num_sub_blocks(&self) -> usize {
        self.num_sub_blocks
    }

    #[inline]
    pub fn span(&self, block: usize, sub_block: usize) -> Span {
        self.spans[self.idx(block, sub_block)]
    }

    #[inline]
    pub fn cursor(&self, block: usize, sub_block: usize) -> u32 {
        self.cursors[self.idx(block, sub_block)]
    }

    #[inline]
    pub fn set_cursor(&mut self, block: usize, sub_block: usize, pos: u32) {
        let i = self.idx(block, sub_block);
        debug_assert!(pos >= self.spans[i].start && pos <= self.spans[i].end);
        self.cursors[i] = pos;
    }
}

/// Partition `sub` into `2^radix` partitions in place, returning the block
/// position map. A radix of zero is a no-op returning an empty map.
///
/// All worker threads must call this concurrently for the same relation:
/// the skew rendezvous inside synchronizes on the staged barrier.
pub fn partition(
    ctx: &JoinContext,
    tid: usize,
    staged: &mut StagedWaiter<'_>,
    sub: &mut SubRel,
    radix: u32,
) -> BlockMap {
    // Only the first pass over S votes on skew; a rewritten plan re-enters
    // here with the new radix and must not vote again.
    let votes_on_skew =
        sub.id == RelId::S && radix > 0 && !ctx.plan.user_defined && !ctx.plan.changed_radix_s();

    if radix == 0 {
        return BlockMap::empty();
    }

    let n = sub.len();
    if n == 0 {
        // No data, but the rendezvous contract still applies: every thread
        // joins both barrier waits or none does.
        if votes_on_skew && estimate_skew(ctx, tid, staged, &[], 0) {
            return partition(ctx, tid, staged, sub, ctx.plan.s_bits());
        }
        return BlockMap::empty();
    }

    let fanout = 1usize << radix;
    let mask = fanout as u32 - 1;

    // Under model III, R is partitioned on high key bits so each partition
    // covers a narrow, dense key range of the global table.
    let shift = if sub.id == RelId::R && ctx.plan.s_bits() == 0 {
        let shift = lg_ceil(ctx.rel_r_size as u32).saturating_sub(radix + 1);
        ctx.plan.set_model_iii_shift(shift);
        shift
    } else {
        0
    };

    // Equal-sized blocks, the remainder spread one tuple per early block.
    let num_blocks = div_ceil(n, CHUNK_SIZE);
    let avg_block_size = n / num_blocks;
    let mut remainder = n % num_blocks;
    let first_block_size = avg_block_size + (remainder > 0) as usize;

    let num_sub_blocks = ctx.num_groups();
    let sub_block_partitions = fanout / num_sub_blocks;
    debug_assert_eq!(fanout % num_sub_blocks, 0, "plan validation enforces divisibility");

    let mut map = BlockMap::new(num_blocks, num_sub_blocks);
    let mut histo: Vec<Counter> = vec![0; fanout];
    let mut scratch: Vec<Tuple> = vec![Tuple::default(); first_block_size];

    let mut from = 0usize;
    for block in 0..num_blocks {
        let length = avg_block_size + (remainder > 0) as usize;
        remainder = remainder.saturating_sub(1);
        let to = from + length;
        debug_assert!(to <= n);

        let tuples = &mut sub.tuples[..];

        /* Histogram of partition frequencies within the block. */
        histo.fill(0);
        for t in &tuples[from..to] {
            histo[radix_hash(t.key, mask, shift) as usize] += 1;
        }

        if block == 0 && votes_on_skew && estimate_skew(ctx, tid, staged, &histo, first_block_size)
        {
            // Unanimous skew: the plan now carries the new S radix. Drop
            // this pass's scratch and start over; a zero radix returns
            // immediately, leaving S unpartitioned.
            return partition(ctx, tid, staged, sub, ctx.plan.s_bits());
        }

        /* Exclusive prefix sum: histo[p] becomes partition p's offset. */
        let mut accum: Counter = 0;
        for h in histo.iter_mut() {
            let count = *h;
            *h = accum;
            accum += count;
        }
        debug_assert_eq!(accum as usize, length);

        /* Record the block's sub-block spans. The first block is placed at
         * the tail of the sub-relation; every later block lands one slot
         * earlier than it was read from. */
        let base = (if block == 0 { n } else { from }) - first_block_size;
        for m in 0..num_sub_blocks {
            let p = m * sub_block_partitions;
            let q = p + sub_block_partitions;
            let start = base + histo[p] as usize;
            let end = base + if q == fanout { length } else { histo[q] as usize };
            map.set_span(block, m, start as u32, end as u32);
        }

        /* Scatter. Block 0 spills to scratch; each later block overwrites
         * the slot vacated by its predecessor, which sits strictly before
         * the tuples still to be read. */
        if block == 0 {
            for t in &tuples[from..to] {
                let h = radix_hash(t.key, mask, shift) as usize;
                scratch[histo[h] as usize] = *t;
                histo[h] += 1;
            }
        } else {
            let (settled, pending) = tuples.split_at_mut(from);
            let directory = &mut settled[from - first_block_size..];
            for t in &pending[..length] {
                let h = radix_hash(t.key, mask, shift) as usize;
                directory[histo[h] as usize] = *t;
                histo[h] += 1;
            }
        }

        from = to;
    }

    /* The trailing slot is the one block 0 vacated; restore it. */
    debug_assert_eq!(from, n);
    sub.tuples[n - first_block_size..].copy_from_slice(&scratch);

    map
}

/// Vote on skew from the local histogram of the first S block, rendezvous,
/// and let thread 0 rewrite the plan on a unanimous vote. Returns whether
/// the plan was rewritten.
///
/// Requiring unanimity keeps the escape hatch from misfiring when skew
/// affects only a few partitions spread unevenly across threads.
fn estimate_skew(
    ctx: &JoinContext,
    tid: usize,
    staged: &mut StagedWaiter<'_>,
    histo: &[Counter],
    block_size: usize,
) -> bool {
    // The unpartitioned-S fallback only pays off when S dominates R.
    if ctx.rel_s_size / ctx.rel_r_size < 3 {
        return false;
    }

    /* Frequencies of the two most common partitions. */
    let (mut max_a, mut max_b) = (0u32, 0u32);
    for &c in histo {
        let c = c as u32;
        if c > max_a {
            max_b = max_a;
            max_a = c;
        } else if c > max_b {
            max_b = c;
        }
    }

    let heavy = if histo.len() > 4 {
        (max_a + max_b) as usize > block_size * 35 / 100
    } else {
        max_a as usize > block_size / 2 + 10
    };

    if heavy {
        ctx.plan.report_skew();
    }

    // All votes are in after this point.
    staged.wait();

    let n = ctx.num_threads() as u32;
    if tid == 0 && ctx.plan.skew_reports() == n {
        info!(
            "high skew observed by all {} threads; switching to model III \
             with R fanout 2^{}, S unpartitioned",
            n,
            ctx.plan.r_bits() + 1
        );
        ctx.plan.rewrite_to_global_table();
    }

    // Wait for the (possibly) rewritten plan.
    staged.wait();

    ctx.plan.skew_reports() == n
}
