//! Property tests: read/write round trip and resize prefix preservation.

use crate::common::*;
use proptest::prelude::*;

fn mode_strategy() -> impl Strategy<Value = MediaMode> {
    prop_oneof![Just(MediaMode::Rewritable), Just(MediaMode::EraseBlock)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn write_then_read_returns_the_bytes(
        mode in mode_strategy(),
        size in 1u32..600,
        offset_seed in any::<u32>(),
        data in prop::collection::vec(any::<u8>(), 1..300),
        fresh in any::<bool>(),
    ) {
        let mut store = formatted(mode, SMALL_BLOCK, 4);
        let offset = offset_seed % size;
        let len = data.len().min((size - offset) as usize);
        let data = &data[..len];

        store.lock_store().unwrap();
        let id = store.new_object(size, None).unwrap();
        if !fresh {
            // Commit first so the write has to clone a stable revision
            store.unlock_store().unwrap();
            store.lock_store().unwrap();
        }
        store.write(id, offset, data).unwrap();
        prop_assert_eq!(store.read(id, offset, len as u32).unwrap(), data.to_vec());
        store.unlock_store().unwrap();

        prop_assert_eq!(store.read(id, offset, len as u32).unwrap(), data.to_vec());
        prop_assert_eq!(store.get_object_size(id).unwrap(), size);
    }

    #[test]
    fn resize_preserves_the_common_prefix(
        mode in mode_strategy(),
        data in prop::collection::vec(any::<u8>(), 1..400),
        new_size in 1u32..800,
    ) {
        let mut store = formatted(mode, SMALL_BLOCK, 4);
        let id = committed(&mut store, &data);

        store.lock_store().unwrap();
        store.set_object_size(id, new_size).unwrap();
        store.unlock_store().unwrap();

        let bytes = content(&mut store, id);
        prop_assert_eq!(bytes.len(), new_size as usize);
        let keep = data.len().min(new_size as usize);
        prop_assert_eq!(&bytes[..keep], &data[..keep]);
        prop_assert!(bytes[keep..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn replace_then_read_returns_the_new_content(
        mode in mode_strategy(),
        first in prop::collection::vec(any::<u8>(), 1..300),
        second in prop::collection::vec(any::<u8>(), 1..300),
    ) {
        let mut store = formatted(mode, SMALL_BLOCK, 4);
        let id = committed(&mut store, &first);

        store.lock_store().unwrap();
        store.replace_object(id, &second).unwrap();
        store.unlock_store().unwrap();

        prop_assert_eq!(content(&mut store, id), second);
    }
}
