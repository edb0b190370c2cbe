//! Property tests for the store's round-trip and idempotence
//! guarantees.

use proptest::prelude::*;
use quarry_cas::LocalCas;
use quarry_common::HashFunction;

fn tmp_cas(hash_function: HashFunction) -> (tempfile::TempDir, LocalCas) {
    let dir = tempfile::tempdir().expect("scratch dir");
    let cas = LocalCas::new(dir.path(), 1, hash_function);
    (dir, cas)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Reading a stored blob yields the stored bytes; storing twice
    /// yields the same digest.
    #[test]
    fn store_read_round_trip(bytes in proptest::collection::vec(any::<u8>(), 0..4096)) {
        for hash_function in [HashFunction::Native, HashFunction::Compatible] {
            let (_dir, cas) = tmp_cas(hash_function);
            let first = cas.store_blob(&bytes, false).unwrap();
            let second = cas.store_blob(&bytes, false).unwrap();
            prop_assert_eq!(&first, &second);
            let path = cas.blob_path(&first, false).unwrap();
            prop_assert_eq!(std::fs::read(path).unwrap(), bytes.clone());
        }
    }

    /// splice(digest, split(digest)) recovers the digest and the exact
    /// bytes, and split is stable across calls.
    #[test]
    fn split_splice_round_trip(seed in any::<u64>(), len in (1usize..3).prop_map(|n| n * 1024 * 1024)) {
        let mut state = seed | 1;
        let bytes: Vec<u8> = (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                (state >> 33) as u8
            })
            .collect();
        let (_dir, cas) = tmp_cas(HashFunction::Native);
        let digest = cas.store_blob(&bytes, false).unwrap();
        let parts = cas.split(&digest).unwrap();
        prop_assert_eq!(&cas.split(&digest).unwrap(), &parts);
        let spliced = cas.splice(&digest, &parts, false).unwrap();
        prop_assert_eq!(&spliced, &digest);
        let path = cas.blob_path(&digest, false).unwrap();
        prop_assert_eq!(std::fs::read(path).unwrap(), bytes);
        // The recorded sizes add up to the whole.
        let total: u64 = parts.iter().map(quarry_common::Digest::size).sum();
        prop_assert_eq!(total as usize, len);
    }
}
