use std::collections::HashSet;

use proptest::prelude::*;

use puzzle_forge::cache::{normalize_key, EmbeddingCache, EntryMetadata, WordType};
use puzzle_forge::dedupe::dedupe_candidates;
use puzzle_forge::similarity::cosine_similarity;
use puzzle_forge::task::{format_task_id, parse_task_id, TaskGenerator};

fn vector(dim: usize) -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-100.0_f32..100.0, dim)
}

proptest! {
    #[test]
    fn pt_normalize_key_idempotent(word in "\\PC{0,24}") {
        let once = normalize_key(&word);
        prop_assert_eq!(normalize_key(&once), once.clone());
        prop_assert_eq!(once.trim(), once.as_str());
    }

    #[test]
    fn pt_cosine_bounded_and_symmetric(
        (a, b) in (1_usize..32).prop_flat_map(|d| (vector(d), vector(d)))
    ) {
        let ab = cosine_similarity(&a, &b);
        let ba = cosine_similarity(&b, &a);
        prop_assert!(ab.is_finite());
        prop_assert!((-1.0..=1.0).contains(&ab));
        prop_assert!((ab - ba).abs() < 1e-6);
    }

    #[test]
    fn pt_cosine_self_is_one(a in vector(16)) {
        prop_assume!(a.iter().any(|v| v.abs() > 1e-3));
        prop_assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn pt_dedupe_keeps_distinct_keys_in_order(
        words in prop::collection::vec("[A-Za-z]{0,6}s?", 0..30)
    ) {
        let dedup = dedupe_candidates(&words);
        prop_assert_eq!(dedup.unique.len() + dedup.skipped.len(), words.len());

        let keys: HashSet<String> = dedup.unique.iter().map(|w| normalize_key(w)).collect();
        prop_assert_eq!(keys.len(), dedup.unique.len());
        prop_assert!(dedup.unique.iter().all(|w| !w.is_empty()));

        // unique 是输入的子序列
        let mut input = words.iter().map(|w| w.trim());
        for kept in &dedup.unique {
            prop_assert!(input.any(|w| w == kept.as_str()));
        }

        let again = dedupe_candidates(&dedup.unique);
        prop_assert_eq!(again.unique, dedup.unique);
    }

    #[test]
    fn pt_task_id_round_trip(
        puzzle in 1_usize..500,
        index in 0_usize..10,
        theme in "[a-z][a-z_ ]{0,12}",
    ) {
        let id = format_task_id(puzzle, index, &theme);
        let pos = parse_task_id(&id).expect("parse task id");
        prop_assert_eq!(pos.puzzle_id, puzzle);
        prop_assert_eq!(pos.theme_index, index);
    }

    #[test]
    fn pt_task_plan_fills_every_slot(
        theme_count in 1_usize..12,
        per_puzzle in 1_usize..6,
        puzzles in 0_usize..8,
    ) {
        let themes: Vec<String> = (0..theme_count).map(|i| format!("theme{i}")).collect();
        let plan = TaskGenerator::create_tasks_for_puzzles(
            &themes,
            &Default::default(),
            per_puzzle,
            puzzles,
        );
        prop_assert_eq!(plan.tasks.len(), per_puzzle * puzzles);
        prop_assert_eq!(plan.themes_reused, theme_count < per_puzzle * puzzles);
        for (slot, task) in plan.tasks.iter().enumerate() {
            let pos = parse_task_id(&task.task_id).expect("task id");
            prop_assert_eq!(pos.puzzle_id, slot / per_puzzle + 1);
            prop_assert_eq!(&task.theme, &themes[slot % theme_count]);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn pt_cache_snapshot_round_trip(
        entries in prop::collection::btree_map("[a-z]{1,10}", vector(6), 1..20)
    ) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("cache.csv");

        tokio_test::block_on(async {
            let cache = EmbeddingCache::new(&path);
            for (word, embedding) in &entries {
                let meta = EntryMetadata::scored("space", WordType::Candidate, 0.5);
                cache.put(word, embedding.clone(), meta).await;
            }
            cache.backup_to_disk().await.expect("backup");

            let restored = EmbeddingCache::new(&path);
            assert_eq!(restored.load_from_disk().await, entries.len());
            for (word, embedding) in &entries {
                let entry = restored.get_entry(word).await.expect("restored entry");
                assert_eq!(&entry.embedding, embedding);
                assert_eq!(entry.word_type, Some(WordType::Candidate));
            }
        });
    }
}
