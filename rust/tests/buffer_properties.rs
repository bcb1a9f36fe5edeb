use phylo_engine::buffer::BufferIndexHelper;
use proptest::collection::vec;
use proptest::prelude::*;

fn offsets(helper: &BufferIndexHelper) -> Vec<usize> {
    (0..helper.max_index()).map(|i| helper.offset_index(i)).collect()
}

proptest! {
    #[test]
    fn test_double_flip_equals_single_flip(
        max_index in 2usize..24,
        flips in vec(any::<usize>(), 0..48),
    ) {
        let mut once = BufferIndexHelper::new(max_index, 1);
        let mut twice = BufferIndexHelper::new(max_index, 1);
        for f in flips {
            let index = 1 + f % (max_index - 1);
            once.flip_offset(index);
            twice.flip_offset(index);
            twice.flip_offset(index);
        }
        prop_assert_eq!(offsets(&once), offsets(&twice));
    }

    #[test]
    fn test_restore_returns_to_stored_offsets(
        max_index in 1usize..24,
        rounds in vec(vec(any::<usize>(), 0..16), 1..6),
        after in vec(any::<usize>(), 0..32),
    ) {
        let mut helper = BufferIndexHelper::new(max_index, 0);
        // Several accepted rounds before the checkpoint under test.
        for round in rounds {
            for f in round {
                helper.flip_offset(f % max_index);
            }
            helper.store_state();
        }
        let checkpoint = offsets(&helper);

        for f in after {
            helper.flip_offset(f % max_index);
        }
        helper.restore_state();
        prop_assert_eq!(offsets(&helper), checkpoint);
    }

    #[test]
    fn test_written_slot_never_overlaps_checkpoint(
        max_index in 2usize..16,
        writes in vec((any::<usize>(), any::<bool>()), 1..32),
    ) {
        let mut helper = BufferIndexHelper::new(max_index, 1);
        helper.store_state();
        let checkpoint = offsets(&helper);
        for (f, flip) in writes {
            let index = 1 + f % (max_index - 1);
            helper.prepare_write(index, flip);
            prop_assert_ne!(helper.offset_index(index), checkpoint[index]);
        }
    }
}
