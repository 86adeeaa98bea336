//! Worker orchestration: spawn pinned threads, run the partition and
//! build/probe phases, reduce the per-thread tallies.

use std::thread;
use std::time::Instant;

use log::{debug, warn};

use crate::buildprobe;
use crate::context::{JoinContext, JoinStats, Model, Worker};
use crate::partition::{partition, BlockMap};
use crate::placement::{pin_current_thread, split_shares};
use crate::{Relation, RelId, SubRel};

/// Run the join. Spawns one worker per configured thread, waits for all of
/// them, and reduces their tallies. The returned stats carry the plan that
/// actually ran, which may differ from the configured one after a skew
/// rewrite.
pub fn execute(ctx: &JoinContext, rel_r: &Relation, rel_s: &Relation) -> JoinStats {
    assert_eq!(rel_r.len(), ctx.rel_r_size, "context was built for a different |R|");
    assert_eq!(rel_s.len(), ctx.rel_s_size, "context was built for a different |S|");

    // The hash tables are indexed by key through raw pointers, so the
    // dense-key contract is enforced up front rather than assumed: every
    // key on either side must lie in R's key domain.
    for rel in [rel_r, rel_s] {
        let in_domain = rel
            .tuples
            .iter()
            .all(|t| t.key >= 1 && t.key as usize <= ctx.rel_r_size);
        assert!(in_domain, "{:?} contains keys outside 1..=|R|", rel.id);
    }

    let n = ctx.num_threads();
    let r_shares = split_shares(rel_r.len(), n);
    let s_shares = split_shares(rel_s.len(), n);

    let mut tallies: Vec<(u64, u64)> = Vec::with_capacity(n);
    thread::scope(|scope| {
        let handles: Vec<_> = (0..n)
            .map(|tid| {
                let seat = ctx.placement.seats[tid];
                let (r_off, r_len) = r_shares[tid];
                let (s_off, s_len) = s_shares[tid];
                let r_slice = &rel_r.tuples[r_off..r_off + r_len];
                let s_slice = &rel_s.tuples[s_off..s_off + s_len];

                scope.spawn(move || {
                    if ctx.config.pin_threads && !pin_current_thread(seat.cpu_os_id) {
                        warn!("thread {tid}: could not pin to CPU {}", seat.cpu_os_id);
                    }

                    // Localize after pinning: the copy is this thread's
                    // first touch, so the pages land on its node.
                    let mut worker = Worker {
                        ctx,
                        tid,
                        group: seat.group,
                        sub_r: SubRel { id: RelId::R, tuples: r_slice.to_vec(), offset: r_off },
                        sub_s: SubRel { id: RelId::S, tuples: s_slice.to_vec(), offset: s_off },
                        blocks_r: BlockMap::empty(),
                        blocks_s: BlockMap::empty(),
                        staged: ctx.staged.waiter(tid),
                        matches: 0,
                        checksum: 0,
                    };
                    run_worker(&mut worker);
                    (worker.matches, worker.checksum)
                })
            })
            .collect();

        for handle in handles {
            tallies.push(handle.join().expect("join worker panicked"));
        }
    });

    let (matches, checksum) = tallies
        .iter()
        .fold((0u64, 0u64), |(m, c), &(tm, tc)| (m + tm, c + tc));

    JoinStats {
        matches,
        checksum,
        r_bits: ctx.plan.r_bits(),
        s_bits: ctx.plan.s_bits(),
        model: ctx.plan.model(),
    }
}

/// One worker's pass through the pipeline. S is partitioned before R so the
/// skew rendezvous can still rewrite R's fanout.
fn run_worker(w: &mut Worker<'_>) {
    let ctx = w.ctx;
    let started = Instant::now();

    if ctx.plan.r_bits() > 0 {
        let phase = Instant::now();
        w.blocks_s = partition(ctx, w.tid, &mut w.staged, &mut w.sub_s, ctx.plan.s_bits());
        w.blocks_r = partition(ctx, w.tid, &mut w.staged, &mut w.sub_r, ctx.plan.r_bits());
        ctx.barrier.wait();
        if w.tid == 0 {
            debug!("partitioning: {:?}", phase.elapsed());
        }
    }

    let phase = Instant::now();
    match ctx.plan.model() {
        Model::One => buildprobe::model_one(w),
        Model::Two => buildprobe::model_two(w),
        Model::Three => buildprobe::model_three(w),
    }

    ctx.barrier.wait();
    if w.tid == 0 {
        debug!("build/probe: {:?}", phase.elapsed());
        debug!("join total: {:?}", started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JoinConfig;
    use crate::generate;
    use crate::topology::Topology;
    use crate::{Key, Tuple};

    fn unpinned(mut cfg: JoinConfig) -> JoinConfig {
        cfg.pin_threads = false;
        cfg
    }

    fn rel_with_keys(id: RelId, keys: &[Key]) -> Relation {
        Relation::new(id, keys.iter().map(|&k| Tuple::new(k, k)).collect())
    }

    /// With payloads seeded to keys and every S key present in R:
    /// `checksum = sum of R keys + sum of S keys`, `matches = |S|`.
    fn expected(rel_r: &Relation, rel_s: &Relation) -> (u64, u64) {
        let r_sum: u64 = rel_r.tuples.iter().map(|t| t.key as u64).sum();
        let s_sum: u64 = rel_s.tuples.iter().map(|t| t.key as u64).sum();
        (rel_s.len() as u64, r_sum + s_sum)
    }

    #[test]
    fn single_thread_model_one() {
        let topo = Topology::uniform(1, 2, 1, 8 << 20, 64);
        let cfg = unpinned(JoinConfig::new(1).with_radix(0));
        let ctx = JoinContext::new(topo, cfg, 1024, 1024).unwrap();

        let rel_r = generate::primary_keys(1024, 12345);
        let rel_s = generate::foreign_keys(1024, 1024, 54321);
        let stats = execute(&ctx, &rel_r, &rel_s);

        assert_eq!(stats.model, Model::One);
        assert_eq!(stats.matches, 1024);
        // 2 * sum(1..=1024).
        assert_eq!(stats.checksum, 1_049_600);
    }

    #[test]
    fn four_threads_model_two() {
        let topo = Topology::uniform(2, 2, 1, 8 << 20, 64);
        let cfg = unpinned(JoinConfig::new(4).with_radix(2));
        let ctx = JoinContext::new(topo, cfg, 1024, 4096).unwrap();
        assert_eq!(ctx.num_groups(), 2);

        let rel_r = generate::primary_keys(1024, 12345);
        let rel_s = generate::foreign_keys(1024, 4096, 54321);
        let (want_matches, want_checksum) = expected(&rel_r, &rel_s);

        let stats = execute(&ctx, &rel_r, &rel_s);
        assert_eq!(stats.model, Model::Two);
        assert_eq!(stats.matches, want_matches);
        assert_eq!(stats.checksum, want_checksum);
    }

    #[test]
    fn auto_plan_selects_model_two_for_large_r() {
        // 1 MiB LLC, 1M-tuple R: 4 MiB of buckets needs 3 radix bits to fit
        // a partition's table into 2/3 of the LLC.
        let topo = Topology::uniform(2, 4, 2, 1 << 20, 64);
        let cfg = unpinned(JoinConfig::new(8));
        let size = 1 << 20;
        let ctx = JoinContext::new(topo, cfg, size, size).unwrap();

        let rel_r = generate::primary_keys(size, 1);
        let rel_s = generate::foreign_keys(size, size, 2);
        let (want_matches, want_checksum) = expected(&rel_r, &rel_s);

        let stats = execute(&ctx, &rel_r, &rel_s);
        assert_eq!(stats.model, Model::Two);
        assert!(stats.r_bits > 0);
        assert_eq!(stats.r_bits, stats.s_bits);
        // Partition table fits in 2/3 LLC.
        let partition_bytes = (size >> stats.r_bits) * std::mem::size_of::<crate::Bucket>();
        assert!(partition_bytes <= (1 << 20) * 2 / 3);
        assert_eq!(stats.matches, want_matches);
        assert_eq!(stats.checksum, want_checksum);
    }

    #[test]
    fn unanimous_skew_demotes_to_model_three() {
        // Tiny LLC forces a partitioned plan; S is 10x R and maximally
        // skewed, so every thread votes heavy and the join runs model III.
        let topo = Topology::uniform(2, 2, 1, 256, 64);
        let cfg = unpinned(JoinConfig::new(4));
        let ctx = JoinContext::new(topo, cfg, 256, 2560).unwrap();
        let r_bits_before = ctx.plan.r_bits();
        assert_eq!(ctx.plan.model(), Model::Two);

        let rel_r = generate::primary_keys(256, 7);
        let rel_s = rel_with_keys(RelId::S, &vec![1; 2560]);
        let (want_matches, want_checksum) = expected(&rel_r, &rel_s);

        let stats = execute(&ctx, &rel_r, &rel_s);
        assert_eq!(stats.model, Model::Three);
        assert_eq!(stats.s_bits, 0);
        assert_eq!(stats.r_bits, r_bits_before + 1);
        assert_eq!(stats.matches, want_matches);
        assert_eq!(stats.checksum, want_checksum);
    }

    #[test]
    fn user_radix_suppresses_skew_demotion() {
        let topo = Topology::uniform(2, 2, 1, 256, 64);
        let cfg = unpinned(JoinConfig::new(4).with_radix(3));
        let ctx = JoinContext::new(topo, cfg, 256, 2560).unwrap();

        let rel_r = generate::primary_keys(256, 7);
        let rel_s = rel_with_keys(RelId::S, &vec![1; 2560]);
        let (want_matches, want_checksum) = expected(&rel_r, &rel_s);

        let stats = execute(&ctx, &rel_r, &rel_s);
        assert_eq!(stats.model, Model::Two);
        assert_eq!(stats.r_bits, 3);
        assert_eq!(stats.matches, want_matches);
        assert_eq!(stats.checksum, want_checksum);
    }

    #[test]
    fn user_model_three_plan() {
        let topo = Topology::uniform(2, 2, 1, 8 << 20, 64);
        let mut cfg = unpinned(JoinConfig::new(4));
        cfg.radix_r = Some(3);
        cfg.radix_s = Some(0);
        let ctx = JoinContext::new(topo, cfg, 1024, 2048).unwrap();

        let rel_r = generate::primary_keys(1024, 3);
        let rel_s = generate::foreign_keys(1024, 2048, 4);
        let (want_matches, want_checksum) = expected(&rel_r, &rel_s);

        let stats = execute(&ctx, &rel_r, &rel_s);
        assert_eq!(stats.model, Model::Three);
        assert_eq!(stats.matches, want_matches);
        assert_eq!(stats.checksum, want_checksum);
    }

    #[test]
    fn max_parallelism_on_tiny_data() {
        // 64 threads on a synthetic 64-CPU box, one tuple each: stresses
        // placement and the staged barrier, not the data path.
        let topo = Topology::uniform(4, 8, 2, 8 << 20, 64);
        let cfg = unpinned(JoinConfig::new(64).with_radix(0));
        let ctx = JoinContext::new(topo, cfg, 64, 64).unwrap();

        let rel_r = generate::primary_keys(64, 5);
        let rel_s = generate::foreign_keys(64, 64, 6);
        let stats = execute(&ctx, &rel_r, &rel_s);

        assert_eq!(stats.matches, 64);
        assert_eq!(stats.checksum, 2 * (64 * 65 / 2));
    }

    #[test]
    fn deterministic_across_runs() {
        let mk = || {
            let topo = Topology::uniform(2, 2, 2, 1 << 15, 64);
            let cfg = unpinned(JoinConfig::new(4));
            JoinContext::new(topo, cfg, 1 << 14, 1 << 15).unwrap()
        };
        let rel_r = generate::primary_keys(1 << 14, 42);
        let rel_s = generate::foreign_keys(1 << 14, 1 << 15, 43);

        let first = execute(&mk(), &rel_r, &rel_s);
        let second = execute(&mk(), &rel_r, &rel_s);
        assert_eq!(first, second);
    }

    #[test]
    fn forced_zero_radix_matches_auto_model_one() {
        let size = 4096;
        let rel_r = generate::primary_keys(size, 8);
        let rel_s = generate::foreign_keys(size, size, 9);

        let topo = || Topology::uniform(2, 2, 1, 8 << 20, 64);
        let auto_ctx = JoinContext::new(topo(), unpinned(JoinConfig::new(4)), size, size).unwrap();
        assert_eq!(auto_ctx.plan.model(), Model::One);
        let auto = execute(&auto_ctx, &rel_r, &rel_s);

        let forced_ctx =
            JoinContext::new(topo(), unpinned(JoinConfig::new(4).with_radix(0)), size, size)
                .unwrap();
        let forced = execute(&forced_ctx, &rel_r, &rel_s);

        assert_eq!(auto.matches, forced.matches);
        assert_eq!(auto.checksum, forced.checksum);
    }

    #[test]
    fn verify_keys_mode_counts_checked_hits() {
        let topo = Topology::uniform(2, 2, 1, 8 << 20, 64);
        let mut cfg = unpinned(JoinConfig::new(4).with_radix(2));
        cfg.verify_keys = true;
        let ctx = JoinContext::new(topo, cfg, 1024, 4096).unwrap();

        let rel_r = generate::primary_keys(1024, 12345);
        let rel_s = generate::foreign_keys(1024, 4096, 54321);
        let (want_matches, want_checksum) = expected(&rel_r, &rel_s);

        let stats = execute(&ctx, &rel_r, &rel_s);
        // Payloads are keys, so verification changes nothing here; the
        // checksum counts keys on both build and probe either way.
        assert_eq!(stats.matches, want_matches);
        assert_eq!(stats.checksum, want_checksum);
    }

    #[test]
    fn zipf_skewed_probe_side_joins_correctly() {
        let topo = Topology::uniform(2, 2, 1, 8 << 20, 64);
        let cfg = unpinned(JoinConfig::new(4).with_radix(2));
        let ctx = JoinContext::new(topo, cfg, 1024, 8192).unwrap();

        let rel_r = generate::primary_keys(1024, 10);
        let rel_s = generate::zipf_keys(1024, 8192, 1.2, 11).unwrap();
        let (want_matches, want_checksum) = expected(&rel_r, &rel_s);

        let stats = execute(&ctx, &rel_r, &rel_s);
        assert_eq!(stats.matches, want_matches);
        assert_eq!(stats.checksum, want_checksum);
    }

    #[test]
    fn empty_probe_side() {
        let topo = Topology::uniform(1, 2, 1, 8 << 20, 64);
        let cfg = unpinned(JoinConfig::new(2).with_radix(0));
        let ctx = JoinContext::new(topo, cfg, 128, 0).unwrap();

        let rel_r = generate::primary_keys(128, 1);
        let rel_s = Relation::new(RelId::S, Vec::new());
        let stats = execute(&ctx, &rel_r, &rel_s);

        assert_eq!(stats.matches, 0);
        assert_eq!(stats.checksum, 128 * 129 / 2);
    }

    #[test]
    fn multi_block_partitioned_join() {
        // Sub-relations larger than one partitioning block.
        let size = crate::partition::CHUNK_SIZE * 5;
        let topo = Topology::uniform(2, 2, 1, 8 << 20, 64);
        let cfg = unpinned(JoinConfig::new(2).with_radix(4));
        let ctx = JoinContext::new(topo, cfg, size, size).unwrap();

        let rel_r = generate::primary_keys(size, 20);
        let rel_s = generate::foreign_keys(size, size, 21);
        let (want_matches, want_checksum) = expected(&rel_r, &rel_s);

        let stats = execute(&ctx, &rel_r, &rel_s);
        assert_eq!(stats.matches, want_matches);
        assert_eq!(stats.checksum, want_checksum);
    }
}
