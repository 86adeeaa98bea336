//! Collaborative build and probe.
//!
//! Three kernels, selected by the final radix plan:
//!
//! * **Model I** (`R_bits == S_bits == 0`): one shared `|R|+1`-cell table,
//!   built and probed by all threads over unpartitioned inputs.
//! * **Model II** (`R_bits == S_bits > 0`): one table per LLC group, sized
//!   to a single R partition. Groups build different tables for different
//!   partitions simultaneously and rotate ownership each step, so a table
//!   is still hot in a group's LLC when that group comes back to probe it.
//! * **Model III** (`R_bits > 0, S_bits == 0`): one `|R|+1`-cell table
//!   filled partition-by-partition with the model II rotation (R was
//!   partitioned on high key bits, so each partition writes a narrow table
//!   region), then probed by a single flat sweep over unpartitioned S.
//!
//! Table cells are written by exactly one thread per iteration: build keys
//! are unique primary keys, partitions are disjoint, and each partition
//! belongs to exactly one `(iteration, group)` pair. Probes happen on the
//! far side of a barrier from the writes. That argument is what licenses
//! the raw-pointer table views used throughout.

use crate::context::{TableView, Worker};
use crate::{lg_ceil, radix_hash, Bucket};

/// A worker's running (matches, checksum) pair.
struct Tally {
    matches: u64,
    checksum: u64,
    /// Store keys instead of payloads and count only verified hits.
    verify_keys: bool,
}

impl Tally {
    fn new(verify_keys: bool) -> Self {
        Self { matches: 0, checksum: 0, verify_keys }
    }

    #[inline(always)]
    fn built(&mut self, key: u32, payload: u32) -> Bucket {
        self.checksum += key as u64;
        if self.verify_keys {
            key
        } else {
            payload
        }
    }

    #[inline(always)]
    fn probed(&mut self, key: u32, cell: Bucket) {
        self.checksum += cell as u64;
        if self.verify_keys {
            self.matches += (cell == key) as u64;
        } else {
            self.matches += 1;
        }
    }
}

/// Zero this thread's contiguous share of a table: `zeroers` threads split
/// the table evenly, the last absorbing the rounding tail. Combined with a
/// following barrier this is both the all-cells-zeroed guarantee and the
/// first-touch page placement.
fn zero_share(table: &TableView, tid: usize, zeroers: usize) {
    if tid >= zeroers {
        return;
    }
    let share = table.len() / zeroers;
    let start = tid * share;
    let end = if tid + 1 == zeroers { table.len() } else { start + share };
    // SAFETY: shares are disjoint by construction and in bounds.
    unsafe { table.zero_range(start, end) };
}

/// Model I: single shared table, no partitioning.
pub fn model_one(w: &mut Worker<'_>) {
    let ctx = w.ctx;
    debug_assert!(ctx.plan.r_bits() == 0 && ctx.plan.s_bits() == 0);

    let n = ctx.num_threads();
    let tid = w.tid;
    let table_size = ctx.rel_r_size + 1;

    if tid == 0 {
        // SAFETY: sole writer; everyone else is held at the next barrier.
        unsafe { ctx.tables.install(0, vec![0; table_size]) };
    }
    ctx.barrier.wait();

    // SAFETY: installed above; discarded only after the final barrier.
    let table = unsafe { ctx.tables.view(0) };

    zero_share(&table, tid, n);
    ctx.barrier.wait();

    let mut tally = Tally::new(ctx.config.verify_keys);

    /* Build: scatter this thread's R share into the shared table. */
    for t in &w.sub_r.tuples {
        let cell = tally.built(t.key, t.payload);
        // SAFETY: keys are unique across all of R, so no two threads write
        // the same cell; keys are in 1..=|R| < table_size.
        unsafe { table.write(t.key as usize, cell) };
    }
    ctx.barrier.wait();

    /* Probe. The result is not materialized; matched payloads feed the
     * checksum instead. */
    for t in &w.sub_s.tuples {
        // SAFETY: foreign keys lie in R's key range; writes ended at the
        // barrier above.
        let cell = unsafe { table.read(t.key as usize) };
        tally.probed(t.key, cell);
    }
    ctx.barrier.wait();

    w.matches = tally.matches;
    w.checksum = tally.checksum;

    if tid == 0 {
        // SAFETY: all probing retired at the barrier above.
        unsafe { ctx.tables.discard(0) };
    }
}

/// Model II: per-group tables, symmetric partitioning, rotating ownership.
pub fn model_two(w: &mut Worker<'_>) {
    let ctx = w.ctx;
    let r_bits = ctx.plan.r_bits();
    debug_assert!(r_bits > 0 && r_bits == ctx.plan.s_bits());

    let n = ctx.num_threads();
    let tid = w.tid;
    let group = w.group;
    let num_groups = ctx.num_groups();
    debug_assert_eq!(tid % num_groups, group);

    let fanout = 1usize << r_bits;
    let mask = fanout as u32 - 1;

    /* One table per group, sized to the next power of two above the average
     * partition. */
    let avg_partition = (ctx.rel_r_size >> r_bits) + 1;
    let table_size = 1usize << lg_ceil(avg_partition as u32);

    if tid == group {
        // SAFETY: `tid % num_groups == group` makes tids 0..num_groups the
        // unique leaders of their group's slot.
        unsafe { ctx.tables.install(group, vec![0; table_size]) };
    }
    ctx.barrier.wait();

    /* First-touch: a couple of threads per group zero each table so its
     * pages spread across the nodes that will hammer it. */
    let zeroers = (num_groups * 2).min(n);
    for g in 0..num_groups {
        // SAFETY: installed above, discarded after the final rendezvous.
        let table = unsafe { ctx.tables.view(g) };
        zero_share(&table, tid, zeroers);
    }
    ctx.barrier.wait();

    let iters = fanout / num_groups;
    debug_assert_eq!(fanout % num_groups, 0);

    let mut tally = Tally::new(ctx.config.verify_keys);

    for i in 0..iters {
        /* Build. On step g, this group scatters partition h*iters+i into
         * group h's table while every other group works a different table;
         * the staged barrier keeps the rotation in lockstep, which mostly
         * matters for cross-LLC false sharing. */
        for g in 0..num_groups {
            let h = (g + group) % num_groups;
            let p = (h * iters + i) as u32;
            // SAFETY: view of an installed table; writes below hit only
            // cells of partition p, owned by this (iteration, group) pair.
            let table = unsafe { ctx.tables.view(h) };

            for b in 0..w.blocks_r.num_blocks() {
                let mut idx = w.blocks_r.cursor(b, h);
                let end = w.blocks_r.span(b, h).end;
                while idx < end {
                    let t = w.sub_r.tuples[idx as usize];
                    if radix_hash(t.key, mask, 0) != p {
                        break;
                    }
                    let cell = tally.built(t.key, t.payload);
                    // SAFETY: unique primary keys; in-partition keys map to
                    // distinct slots below table_size.
                    unsafe { table.write((t.key >> r_bits) as usize, cell) };
                    idx += 1;
                }
                w.blocks_r.set_cursor(b, h, idx);
            }

            w.staged.wait();
        }

        /* Probe, rotating through the groups in reverse so this group
         * starts on the table it just finished building. */
        for g in (0..num_groups).rev() {
            let h = (g + group) % num_groups;
            let p = (h * iters + i) as u32;
            // SAFETY: builds for this iteration retired at the staged
            // barrier ending the build rotation.
            let table = unsafe { ctx.tables.view(h) };

            for b in 0..w.blocks_s.num_blocks() {
                let mut idx = w.blocks_s.cursor(b, h);
                let end = w.blocks_s.span(b, h).end;
                while idx < end {
                    let t = w.sub_s.tuples[idx as usize];
                    if radix_hash(t.key, mask, 0) != p {
                        break;
                    }
                    // SAFETY: see the probe note on the build barrier.
                    let cell = unsafe { table.read((t.key >> r_bits) as usize) };
                    tally.probed(t.key, cell);
                    idx += 1;
                }
                w.blocks_s.set_cursor(b, h, idx);
            }
        }

        /* No building for the next partitions until all probing is done. */
        w.staged.wait();
    }

    w.matches = tally.matches;
    w.checksum = tally.checksum;

    if tid == group {
        // SAFETY: the staged barrier ending the last iteration retired all
        // probes of this group's table.
        unsafe { ctx.tables.discard(group) };
    }
}

/// Model III: global `|R|+1` table built from high-bit partitions of R,
/// probed by a flat sweep over unpartitioned S.
pub fn model_three(w: &mut Worker<'_>) {
    let ctx = w.ctx;
    let r_bits = ctx.plan.r_bits();
    debug_assert!(r_bits > 0 && ctx.plan.s_bits() == 0);

    let tid = w.tid;
    let group = w.group;
    let num_groups = ctx.num_groups();
    debug_assert_eq!(tid % num_groups, group);

    let fanout = 1usize << r_bits;
    let mask = fanout as u32 - 1;
    let shift = ctx.plan.model_iii_shift();
    let table_size = ctx.rel_r_size + 1;

    if tid == 0 {
        // SAFETY: sole writer; everyone else is held at the next barrier.
        // No per-thread zeroing pass here: R's high-bit partitions write
        // narrow table regions, so the build itself is the first touch
        // that places pages.
        unsafe { ctx.tables.install(0, vec![0; table_size]) };
    }
    ctx.barrier.wait();

    // SAFETY: installed above; discarded only after the final barrier.
    let table = unsafe { ctx.tables.view(0) };

    let iters = fanout / num_groups;
    debug_assert_eq!(fanout % num_groups, 0);

    let mut tally = Tally::new(ctx.config.verify_keys);

    /* Build with the model II rotation; the table index is the raw key. */
    for i in 0..iters {
        for g in 0..num_groups {
            let h = (g + group) % num_groups;
            let p = (h * iters + i) as u32;

            for b in 0..w.blocks_r.num_blocks() {
                let mut idx = w.blocks_r.cursor(b, h);
                let end = w.blocks_r.span(b, h).end;
                while idx < end {
                    let t = w.sub_r.tuples[idx as usize];
                    if radix_hash(t.key, mask, shift) != p {
                        break;
                    }
                    let cell = tally.built(t.key, t.payload);
                    // SAFETY: unique primary keys in 1..=|R| < table_size.
                    unsafe { table.write(t.key as usize, cell) };
                    idx += 1;
                }
                w.blocks_r.set_cursor(b, h, idx);
            }

            w.staged.wait();
        }
    }

    /* Every partition's table region must exist before any thread starts
     * the flat probe. */
    ctx.barrier.wait();

    for t in &w.sub_s.tuples {
        // SAFETY: foreign keys lie in R's key range; writes ended above.
        let cell = unsafe { table.read(t.key as usize) };
        tally.probed(t.key, cell);
    }
    ctx.barrier.wait();

    w.matches = tally.matches;
    w.checksum = tally.checksum;

    if tid == 0 {
        // SAFETY: all probing retired at the barrier above.
        unsafe { ctx.tables.discard(0) };
    }
}
