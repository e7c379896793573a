//! Integration tests exercising the metadata layer and the target's bio
//! pipeline together, the way a single `dm-hsm` instance would see them
//! across a suspend/resume cycle or a process restart. Every backing
//! device here is an anonymous, memmap2-backed [`block_cache::BlockCache`]
//! (spec.md section 8's scenario devices) rather than a real block device.

use std::sync::Arc;

use block_cache::{BlockCache, CacheOptions};
use hsm::bio::Bio;
use hsm::metadata::Metadata;
use hsm::target::{HsmTarget, TargetArgs};

fn anon_metadata_device(nr_blocks: u64) -> Arc<BlockCache> {
    Arc::new(BlockCache::create_anon(CacheOptions { block_size: 4096, nr_blocks, cache_size: nr_blocks as usize }).unwrap())
}

fn bio(sector: u64, len_sectors: u32, is_write: bool) -> Bio {
    Bio { sector, len_sectors, is_write, is_flush: false, is_fua: false, is_discard: false, is_readahead: false }
}

/// Insert/lookup survives a fresh [`Metadata::open`] over the same
/// backing device, the way a process restart would reopen it.
#[test]
fn mappings_survive_reopen_across_metadata_handles() {
    let bm = anon_metadata_device(64);

    let (pblock, flags) = {
        let mut md = Metadata::open(bm.clone(), 8, 16).unwrap();
        let (pblock, flags) = md.insert(0, 5).unwrap();
        md.update(0, 5, 0b0010).unwrap();
        md.commit().unwrap();
        (pblock, flags)
    };
    let _ = flags;

    let reopened = Metadata::open(bm, 8, 16).unwrap();
    let (reopened_pblock, reopened_flags) = reopened.lookup(0, 5, true).unwrap();
    assert_eq!(reopened_pblock, pblock);
    assert_eq!(reopened_flags, 0b0010);
    assert_eq!(reopened.get_provisioned_blocks(), 1);
}

/// A stream of inserts that exceeds the data device's capacity parks
/// bios; once a mapping is removed and committed, the next worker pass
/// evicts a victim and admits a parked bio (spec.md section 8, "No-space
/// -> progress").
#[test]
fn no_space_releases_a_parked_bio_after_an_eviction() {
    let meta_bm = anon_metadata_device(64);
    let args = TargetArgs {
        cached_dev: "/dev/slow0".into(),
        data_dev: "/dev/fast0".into(),
        meta_dev: "/dev/meta0".into(),
        data_block_size_sectors: 8,
    };
    let target = HsmTarget::ctr(args, meta_bm, 2, 4).unwrap();

    target.map(bio(0, 8, true));
    target.run_once().unwrap();
    target.map(bio(8, 8, true));
    target.run_once().unwrap();

    // Both cache blocks are now provisioned and idle (their writes
    // already committed and released), so the same pass that parks the
    // third bio also finds an idle victim and evicts it.
    target.map(bio(16, 8, true));
    target.run_once().unwrap();
    assert!(!target.is_no_space());

    // The freed pool block lets the previously-parked bio through.
    target.run_once().unwrap();
    assert!(!target.is_no_space());
    assert_eq!(target.status().allocated_blocks, 2);
}

/// Suspend stops admitting bios and drains what's already queued;
/// `preresume` re-queues any mapping left `Dirty` by the interruption
/// (spec.md section 8, S6).
#[test]
fn suspend_then_resume_replays_dirty_mappings() {
    let meta_bm = anon_metadata_device(64);
    let args = TargetArgs {
        cached_dev: "/dev/slow0".into(),
        data_dev: "/dev/fast0".into(),
        meta_dev: "/dev/meta0".into(),
        data_block_size_sectors: 8,
    };
    let target = HsmTarget::ctr(args, meta_bm, 4, 4).unwrap();

    target.map(bio(0, 8, true));
    target.run_once().unwrap();

    target.presuspend();
    use hsm::bio::MapAction;
    assert_eq!(target.map(bio(8, 8, true)), MapAction::Requeue);

    let stranded = target.postsuspend().unwrap();
    assert!(stranded.is_empty(), "nothing was left mid-flight to strand");

    target.preresume().unwrap();
    assert_eq!(target.map(bio(0, 8, false)), MapAction::Submitted);
    target.run_once().unwrap();
}

/// A partial (sub-block) read against a block that isn't cached yet must
/// wait for a copy-in before it resolves; once the simulated copier
/// completes it, the next pass commits the new mapping.
#[test]
fn partial_read_waits_for_copy_in_before_committing() {
    let meta_bm = anon_metadata_device(64);
    let args = TargetArgs {
        cached_dev: "/dev/slow0".into(),
        data_dev: "/dev/fast0".into(),
        meta_dev: "/dev/meta0".into(),
        data_block_size_sectors: 8,
    };
    let target = HsmTarget::ctr(args, meta_bm, 4, 4).unwrap();

    target.map(bio(0, 4, false));
    let first_pass_mutated = target.run_once().unwrap();
    assert!(first_pass_mutated, "the allocation itself mutates metadata even before the copy-in lands");
    assert_eq!(target.status().allocated_blocks, 1);

    let second_pass_mutated = target.run_once().unwrap();
    assert!(second_pass_mutated, "the copy-in completion updates the block's Uptodate flag");
}
