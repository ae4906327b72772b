//! Property-based tests across the workspace.

use proptest::prelude::*;

// ============================================================================
// Command codec properties
// ============================================================================

mod codec_properties {
    use super::*;
    use adcx_proto::{AdcCommand, Code, Sid};

    fn param_strategy() -> impl Strategy<Value = String> {
        // Parameters exercising all escape classes.
        proptest::collection::vec(
            prop_oneof![
                proptest::char::range('a', 'z').prop_map(|c| c.to_string()),
                Just(" ".to_string()),
                Just("\\".to_string()),
                Just("\n".to_string()),
                proptest::char::range('0', '9').prop_map(|c| c.to_string()),
            ],
            1..16,
        )
        .prop_map(|parts| parts.concat())
    }

    proptest! {
        /// Emitting then parsing a command yields the same parameters.
        #[test]
        fn command_roundtrip(params in proptest::collection::vec(param_strategy(), 0..6)) {
            let mut cmd = AdcCommand::broadcast(Code::MSG);
            for p in &params {
                cmd = cmd.add_param(p.clone());
            }
            let sid = Sid::parse("ABCD").unwrap();
            let line = cmd.to_line(sid);
            let parsed = AdcCommand::parse(&line).unwrap();

            prop_assert_eq!(parsed.from(), sid);
            prop_assert_eq!(parsed.code(), Code::MSG);
            prop_assert_eq!(parsed.params(), &params[..]);
        }

        /// Escaped parameters never contain raw separators.
        #[test]
        fn escaped_lines_have_no_raw_separators(param in param_strategy()) {
            let escaped = adcx_proto::command::escape(&param);
            prop_assert!(!escaped.contains(' '));
            prop_assert!(!escaped.contains('\n'));
            prop_assert_eq!(adcx_proto::command::unescape(&escaped), param);
        }
    }
}

// ============================================================================
// Tiger tree properties
// ============================================================================

mod tth_properties {
    use super::*;
    use adcx_proto::tth::{hash_buffer, TigerTree};

    proptest! {
        /// Streaming in arbitrary chunk sizes matches one-shot hashing.
        #[test]
        fn chunking_is_irrelevant(
            data in proptest::collection::vec(any::<u8>(), 0..8192),
            chunk in 1usize..512,
        ) {
            let oneshot = hash_buffer(&data);
            let mut streaming = TigerTree::for_file(data.len() as u64);
            for piece in data.chunks(chunk) {
                streaming.update(piece);
            }
            let streamed = streaming.finalize();
            prop_assert_eq!(oneshot.root, streamed.root);
            prop_assert_eq!(oneshot.leaves, streamed.leaves);
        }

        /// Different content yields different roots (tiger collisions not
        /// expected at this scale).
        #[test]
        fn content_sensitivity(data in proptest::collection::vec(any::<u8>(), 1..2048)) {
            let mut altered = data.clone();
            altered[0] ^= 0x01;
            prop_assert_ne!(hash_buffer(&data).root, hash_buffer(&altered).root);
        }
    }
}

// ============================================================================
// Share tree properties
// ============================================================================

mod share_properties {
    use super::*;
    use adcx_proto::tth::hash_buffer;
    use adcx_search::query::MatchType;
    use adcx_search::SearchQuery;
    use adcx_share::dual_string::DualString;
    use adcx_share::profile::ShareRoot;
    use adcx_share::tree::{Directory, ShareTree};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn name_strategy() -> impl Strategy<Value = String> {
        "[a-z]{1,8}(\\.[a-z]{2,3})?"
    }

    fn build_share(names: &[String]) -> ShareTree {
        let tree = ShareTree::new();
        let root = Arc::new(ShareRoot::new(
            PathBuf::from("/mnt/prop"),
            "Prop",
            [0u32].into_iter().collect(),
            false,
        ));
        let dir = Directory::new_root(root, 1);
        for (i, name) in names.iter().enumerate() {
            let _ = Directory::add_file(
                &dir,
                DualString::new(name.clone()),
                (i as u64 + 1) * 10,
                1,
                hash_buffer(name.as_bytes()).root,
            );
        }
        tree.replace_root_subtree(dir).unwrap();
        tree
    }

    proptest! {
        /// Every shared name token passes the bloom filter.
        #[test]
        fn bloom_has_no_false_negatives(
            names in proptest::collection::vec(name_strategy(), 1..20),
        ) {
            let tree = build_share(&names);
            for name in &names {
                prop_assert!(tree.bloom_contains(&name.to_lowercase()));
            }
        }

        /// Adding an include term never grows the result set.
        #[test]
        fn search_monotonicity(
            names in proptest::collection::vec(name_strategy(), 1..20),
            term_a in "[a-z]{1,4}",
            term_b in "[a-z]{1,4}",
        ) {
            let tree = build_share(&names);

            let mut broad = SearchQuery::from_text(&term_a, &[], &[], MatchType::PathPartial);
            broad.max_results = 100;
            let broad_hits = tree.search(&mut broad, 0).len();

            let narrow_text = format!("{term_a} {term_b}");
            let mut narrow = SearchQuery::from_text(&narrow_text, &[], &[], MatchType::PathPartial);
            narrow.max_results = 100;
            let narrow_hits = tree.search(&mut narrow, 0).len();

            prop_assert!(narrow_hits <= broad_hits);
        }

        /// Every file reached through the TTH index chains back to a root
        /// and keeps its recorded size.
        #[test]
        fn tth_index_files_reach_roots(
            names in proptest::collection::vec(name_strategy(), 1..15),
        ) {
            let tree = build_share(&names);
            for name in &names {
                let tth = adcx_proto::tth::hash_buffer(name.as_bytes()).root;
                for file in tree.files_by_tth(&tth, None) {
                    let root = file.parent().and_then(|d| d.find_root());
                    prop_assert!(root.is_some());
                    prop_assert!(file.real_path().starts_with("/mnt/prop"));
                }
            }
        }
    }
}

// ============================================================================
// Refresh idempotence
// ============================================================================

mod refresh_properties {
    use super::*;
    use adcx_share::{
        HashStore, MemoryHashStore, RefreshEngine, RefreshKind, ShareTree, ShareValidator,
    };
    use adcx_share::profile::ShareRoot;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]
        /// Refreshing an unchanged directory twice yields identical totals
        /// and no re-hashing on the second pass.
        #[test]
        fn double_refresh_is_idempotent(
            files in proptest::collection::btree_map("[a-z]{1,8}", 1usize..2000, 1..10),
        ) {
            let tmp = tempfile::tempdir().unwrap();
            for (name, len) in &files {
                std::fs::write(tmp.path().join(format!("{name}.bin")), vec![0xA5u8; *len]).unwrap();
            }

            let tree = Arc::new(ShareTree::new());
            let validator = Arc::new(ShareValidator::new());
            let store: Arc<dyn HashStore> = Arc::new(MemoryHashStore::new());
            let engine = RefreshEngine::new(Arc::clone(&tree), validator, store);
            engine.register_root(Arc::new(ShareRoot::new(
                tmp.path().to_path_buf(),
                "Prop",
                [0u32].into_iter().collect(),
                false,
            )));

            let first = engine.run_task(&RefreshKind::Startup, &AtomicBool::new(false)).unwrap();
            let totals_after_first = tree.total_stats();
            prop_assert_eq!(first.new_files as usize, files.len());

            let second = engine.run_task(&RefreshKind::Startup, &AtomicBool::new(false)).unwrap();
            prop_assert_eq!(second.hash_size, 0);
            prop_assert_eq!(second.new_files, 0);
            prop_assert_eq!(tree.total_stats(), totals_after_first);
        }
    }
}

// ============================================================================
// Upload slot accounting
// ============================================================================

mod slot_properties {
    use super::*;
    use adcx_proto::Pid;
    use adcx_share::dual_string::DualString;
    use adcx_share::hash_store::{FileIdentity, MemoryHashStore};
    use adcx_share::profile::ShareRoot;
    use adcx_share::tree::{Directory, ShareTree};
    use adcx_share::HashStore as _;
    use adcx_transfer::{SlotKind, UploadConfig, UploadRequest, UploadScheduler, UploadUser};
    use std::sync::Arc;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        /// However many peers ask, at most `slots` standard slots are
        /// charged and everyone else queues.
        #[test]
        fn standard_slots_never_oversubscribe(peers in 1usize..12, slots in 1u32..4) {
            let tmp = tempfile::tempdir().unwrap();
            let data = vec![0u8; 200_000];
            let path = tmp.path().join("big.bin");
            std::fs::write(&path, &data).unwrap();
            let hashed = adcx_proto::tth::hash_buffer(&data);

            let store = Arc::new(MemoryHashStore::new());
            store.add_file(
                &path.to_string_lossy().to_lowercase(),
                FileIdentity { size: 200_000, mtime: 1 },
                hashed.clone(),
            );

            let tree = Arc::new(ShareTree::new());
            let root = Arc::new(ShareRoot::new(
                tmp.path().to_path_buf(),
                "S",
                [0u32].into_iter().collect(),
                false,
            ));
            let dir = Directory::new_root(root, 1);
            let _ = Directory::add_file(&dir, DualString::new("big.bin"), 200_000, 1, hashed.root);
            tree.replace_root_subtree(dir).unwrap();

            let scheduler = UploadScheduler::new(
                tree,
                store,
                None,
                UploadConfig {
                    slots,
                    extra_slots: 0,
                    minislot_size: 1,
                    free_extensions: vec![],
                    ..UploadConfig::default()
                },
                Pid::from_bytes([0xEE; 24]).derive_cid(),
            );

            let mut granted = 0u32;
            for i in 0..peers {
                let user = UploadUser {
                    cid: Pid::from_bytes([i as u8 + 1; 24]).derive_cid(),
                    profile: 0,
                    profiles: [0u32].into_iter().collect(),
                    favorite: false,
                    op: false,
                    mcn: false,
                    supports_minislots: false,
                };
                let request = UploadRequest {
                    kind: "file".into(),
                    path: "/S/big.bin".into(),
                    start: 0,
                    bytes: -1,
                    recursive: false,
                    tth_list: false,
                    current_slot: SlotKind::None,
                };
                match scheduler.prepare_upload(&request, &user, "t", 0) {
                    Ok(prepared) => {
                        prop_assert_eq!(prepared.slot, SlotKind::Std);
                        granted += 1;
                    }
                    Err(adcx_transfer::UploadError::SlotsFull { .. }) => {}
                    Err(other) => return Err(TestCaseError::fail(format!("{other}"))),
                }
            }

            prop_assert_eq!(granted, slots.min(peers as u32));
            prop_assert_eq!(scheduler.free_slots(), 0.max(slots as i64 - granted as i64) as u32);
            prop_assert_eq!(
                scheduler.waiting_users().len(),
                peers.saturating_sub(slots as usize)
            );
        }
    }
}
