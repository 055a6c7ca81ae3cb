mod common;

use common::{provider, ScriptedBackend};
use proptest::prelude::*;
use shmbuf_core::AllocAlignment;
use std::sync::Arc;
use std::thread;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn precomputed_alloc_matches_direct(size in 1usize..2048, pow in 0u8..8, granularity in 0u8..7) {
        let backend = ScriptedBackend::new(4)
            .with_granularity(AllocAlignment::new(granularity).unwrap());
        let provider = provider(backend);
        let align = 1usize << pow;

        let layout = provider.alloc_layout(size, align).unwrap();
        let precomputed = layout.alloc().unwrap();
        let direct = provider.alloc(size, align).unwrap();

        prop_assert!(precomputed.len() >= size);
        prop_assert_eq!(precomputed.len(), direct.len());
        prop_assert_eq!(precomputed.as_ptr() as usize % align, 0);
        prop_assert_eq!(direct.as_ptr() as usize % align, 0);
    }

    #[test]
    fn freeze_then_downgrade_keeps_contents(contents in proptest::collection::vec(any::<u8>(), 1..1024)) {
        let provider = provider(ScriptedBackend::new(1));
        let mut buf = provider.alloc(contents.len(), 1).unwrap();
        buf.copy_from_slice(&contents);
        let descriptor = buf.descriptor();

        let back = buf.freeze().try_downgrade().unwrap();
        prop_assert_eq!(back.descriptor(), descriptor);
        prop_assert_eq!(&back[..], &contents[..]);
    }

    #[test]
    fn downgrade_fails_while_shared(contents in proptest::collection::vec(any::<u8>(), 1..256), clones in 1usize..8) {
        let backend = ScriptedBackend::new(1);
        let stats = backend.stats();
        let provider = provider(backend);
        let mut buf = provider.alloc(contents.len(), 1).unwrap();
        buf.copy_from_slice(&contents);

        let shared = buf.freeze();
        let others: Vec<_> = (0..clones).map(|_| shared.clone()).collect();
        let err = shared.try_downgrade().unwrap_err();
        prop_assert_eq!(&err.buf()[..], &contents[..]);
        prop_assert_eq!(err.buf().ref_count(), clones + 1);

        let shared = err.into_inner();
        drop(others);
        prop_assert_eq!(stats.frees(), 0);
        let exclusive = shared.try_downgrade().unwrap();
        prop_assert_eq!(&exclusive[..], &contents[..]);
        drop(exclusive);
        prop_assert_eq!(stats.frees(), 1);
    }

    #[test]
    fn concurrent_clone_drop_frees_once(plan in proptest::collection::vec(1usize..16, 2..6)) {
        let backend = ScriptedBackend::new(1);
        let stats = backend.stats();
        let provider = provider(backend);
        let shared = provider.alloc(64, 8).unwrap().freeze();

        let handles: Vec<_> = plan
            .iter()
            .map(|&clones| {
                let mine = shared.clone();
                thread::spawn(move || {
                    let copies: Vec<_> = (0..clones).map(|_| mine.clone()).collect();
                    for copy in copies {
                        assert_eq!(copy.len(), 64);
                    }
                    drop(mine);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        prop_assert_eq!(stats.frees(), 0);
        prop_assert_eq!(shared.ref_count(), 1);
        drop(shared);
        prop_assert_eq!(stats.frees(), 1);
        prop_assert_eq!(stats.bad_frees.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn last_holder_frees_regardless_of_order(order in Just((0..6usize).collect::<Vec<_>>()).prop_shuffle()) {
        let backend = ScriptedBackend::new(1);
        let stats = backend.stats();
        let provider = Arc::new(provider(backend));
        let first = provider.alloc(8, 8).unwrap().freeze();
        let mut holders: Vec<Option<_>> = (0..6).map(|_| Some(first.clone())).collect();
        drop(first);

        for (step, i) in order.into_iter().enumerate() {
            prop_assert_eq!(stats.frees(), 0);
            holders[i].take();
            if step == 5 {
                prop_assert_eq!(stats.frees(), 1);
            }
        }
    }
}
