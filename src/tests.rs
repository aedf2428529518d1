//! Cross-module concurrency and consistency scenarios.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::key::KeyHandle;
use crate::{Cache, CacheOptions, Error, Frontend, RecordWriter};

/// Poll `cond` until it holds or `timeout` passes; background eviction
/// cascades and the scheduler need a moment to settle.
fn wait_until(timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached within {timeout:?}");
}

#[test]
fn first_get_populates_later_gets_reuse() {
    let cache = Cache::new(CacheOptions::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let frontend = cache.new_frontend({
        let calls = Arc::clone(&calls);
        move |key: &String, writer: &mut RecordWriter| {
            calls.fetch_add(1, Ordering::SeqCst);
            serde_json::to_writer(&mut *writer, key)?;
            Ok(())
        }
    });

    for _ in 0..2 {
        let record = frontend.get("key1".to_owned()).expect("get");
        let value: String = record.decode_json().expect("json");
        assert_eq!(value, "key1");
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    cache.assert_consistent();
}

#[test]
fn concurrent_gets_elect_a_single_generator() {
    let cache = Cache::new(CacheOptions::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let frontend = cache.new_frontend({
        let calls = Arc::clone(&calls);
        move |key: &String, writer: &mut RecordWriter| {
            calls.fetch_add(1, Ordering::SeqCst);
            // Let the other requesters pile up on the gate.
            thread::sleep(Duration::from_millis(10));
            serde_json::to_writer(&mut *writer, key)?;
            Ok(())
        }
    });

    thread::scope(|scope| {
        for _ in 0..100 {
            scope.spawn(|| {
                let record = frontend.get("key1".to_owned()).expect("get");
                let value: String = record.decode_json().expect("json");
                assert_eq!(value, "key1");
            });
        }
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let record = frontend.get("key1".to_owned()).expect("get");
    let frame_bytes: usize = record.compressed_chunks().iter().map(|c| c.len()).sum();
    assert_eq!(cache.memory_used(), frame_bytes);
    cache.assert_consistent();
}

#[test]
fn concurrent_frontends_share_one_cache() {
    let cache = Cache::new(CacheOptions::default());
    let frontends: Vec<Frontend<String>> = (0..3)
        .map(|_| {
            cache.new_frontend(|key: &String, writer: &mut RecordWriter| {
                serde_json::to_writer(&mut *writer, key)?;
                Ok(())
            })
        })
        .collect();

    thread::scope(|scope| {
        for frontend in &frontends {
            for key_id in 0..3 {
                for _ in 0..6 {
                    scope.spawn(move || {
                        let key = format!("key{key_id}");
                        let record = frontend.get(key.clone()).expect("get");
                        let value: String = record.decode_json().expect("json");
                        assert_eq!(value, key);
                    });
                }
            }
        }
    });

    assert_eq!(cache.record_count(), 9);
    cache.assert_consistent();
}

// ============================================================================
// Recursive inclusion across frontends and caches
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct TreeKey {
    cache: usize,
    frontend: usize,
    key: usize,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct TreeNode {
    data: TreeKey,
    children: Vec<TreeNode>,
}

/// The tree a generated record must decode to: recursion towards lower
/// keys within the frontend, lower frontends within the cache and lower
/// caches across the registry.
fn expected_tree(key: TreeKey) -> TreeNode {
    let mut children = Vec::new();
    if key.key > 0 {
        children.push(expected_tree(TreeKey {
            key: key.key - 1,
            ..key
        }));
    }
    if key.frontend > 0 {
        children.push(expected_tree(TreeKey {
            frontend: key.frontend - 1,
            ..key
        }));
    }
    if key.cache > 0 {
        children.push(expected_tree(TreeKey {
            cache: key.cache - 1,
            ..key
        }));
    }
    TreeNode {
        data: key,
        children,
    }
}

type TreeGrid = Vec<Vec<Frontend<TreeKey>>>;

/// Three caches with three frontends each, whose generators emit a JSON
/// node and include their recursive children.
fn tree_caches(options: CacheOptions) -> (Vec<Arc<Cache>>, Arc<OnceLock<TreeGrid>>) {
    let grid: Arc<OnceLock<TreeGrid>> = Arc::new(OnceLock::new());
    let mut caches = Vec::new();
    let mut frontends = Vec::new();

    for _ in 0..3 {
        let cache = Cache::new(options.clone());
        let mut row = Vec::new();
        for _ in 0..3 {
            let grid = Arc::clone(&grid);
            row.push(
                cache.new_frontend(move |key: &TreeKey, writer: &mut RecordWriter| {
                    let frontends = grid.get().expect("grid initialized");

                    writer.write_all(br#"{"data":"#)?;
                    serde_json::to_writer(&mut *writer, key)?;
                    // Also exercises the reader-driven write path.
                    writer.read_from(&mut &br#","children":["#[..])?;

                    let mut children = Vec::new();
                    if key.key > 0 {
                        children.push(TreeKey {
                            key: key.key - 1,
                            ..*key
                        });
                    }
                    if key.frontend > 0 {
                        children.push(TreeKey {
                            frontend: key.frontend - 1,
                            ..*key
                        });
                    }
                    if key.cache > 0 {
                        children.push(TreeKey {
                            cache: key.cache - 1,
                            ..*key
                        });
                    }
                    for (index, child) in children.into_iter().enumerate() {
                        if index > 0 {
                            writer.write_all(b",")?;
                        }
                        writer.include(&frontends[child.cache][child.frontend], child)?;
                    }

                    writer.write_all(b"]}")?;
                    Ok(())
                }),
            );
        }
        caches.push(cache);
        frontends.push(row);
    }

    let _ = grid.set(frontends);
    (caches, grid)
}

/// Fetch every key of the grid concurrently, six readers per key, and
/// verify the decoded trees.
fn run_tree_workload(grid: &TreeGrid) {
    thread::scope(|scope| {
        for (cache_id, row) in grid.iter().enumerate() {
            for (frontend_id, frontend) in row.iter().enumerate() {
                for key_id in 0..3 {
                    for _ in 0..6 {
                        scope.spawn(move || {
                            let key = TreeKey {
                                cache: cache_id,
                                frontend: frontend_id,
                                key: key_id,
                            };
                            let record = frontend.get(key).expect("get");
                            let tree: TreeNode = record.decode_json().expect("json");
                            assert_eq!(tree, expected_tree(key));
                        });
                    }
                }
            }
        }
    });
}

#[test]
fn recursive_includes_decode_to_the_expected_trees() {
    let (caches, grid) = tree_caches(CacheOptions::default());
    run_tree_workload(grid.get().expect("grid"));

    for cache in &caches {
        assert_eq!(cache.record_count(), 9);
        cache.assert_consistent();
    }
}

#[test]
fn eviction_cascades_through_the_include_graph() {
    let (caches, grid) = tree_caches(CacheOptions::default());
    let frontends = grid.get().expect("grid");
    run_tree_workload(frontends);

    // Every other record's inclusion chain passes through (0, 0, 0), so
    // evicting it must empty all three caches. Cross-cache cascades run on
    // background threads.
    frontends[0][0].evict(
        Duration::ZERO,
        TreeKey {
            cache: 0,
            frontend: 0,
            key: 0,
        },
    );
    wait_until(Duration::from_secs(5), || {
        caches.iter().map(|cache| cache.record_count()).sum::<usize>() == 0
    });

    for cache in &caches {
        assert_eq!(cache.memory_used(), 0);
        cache.assert_consistent();
    }
}

#[test]
fn evicting_a_leaf_spares_unrelated_records() {
    let (caches, grid) = tree_caches(CacheOptions::default());
    let frontends = grid.get().expect("grid");
    run_tree_workload(frontends);

    let evicted = TreeKey {
        cache: 0,
        frontend: 0,
        key: 1,
    };
    frontends[0][0].evict(Duration::ZERO, evicted);

    // (0, 0, 0) is included *by* the evicted record, not the other way
    // around; cascades only travel towards includers.
    let kept = TreeKey {
        cache: 0,
        frontend: 0,
        key: 0,
    };
    assert!(caches[0].contains(0, &KeyHandle::new(kept)));
    assert!(!caches[0].contains(0, &KeyHandle::new(evicted)));
    caches[0].assert_consistent();
}

#[test]
fn frontend_eviction_leaves_other_frontends_alone() {
    let (caches, grid) = tree_caches(CacheOptions::default());
    let frontends = grid.get().expect("grid");
    run_tree_workload(frontends);

    // Records of cache 2's frontend 2 sit at the top of the include graph:
    // nothing outside that frontend includes them, so the sweep is fully
    // synchronous and confined.
    frontends[2][2].evict_all(Duration::ZERO);

    assert_eq!(caches[2].record_count(), 6);
    for frontend_id in 0..2 {
        for key_id in 0..3 {
            assert!(caches[2].contains(
                frontend_id,
                &KeyHandle::new(TreeKey {
                    cache: 2,
                    frontend: frontend_id,
                    key: key_id,
                })
            ));
        }
    }
    assert_eq!(caches[0].record_count(), 9);
    assert_eq!(caches[1].record_count(), 9);
    for cache in &caches {
        cache.assert_consistent();
    }
}

#[test]
fn evict_by_func_matches_typed_keys() {
    let (caches, grid) = tree_caches(CacheOptions::default());
    let frontends = grid.get().expect("grid");
    run_tree_workload(frontends);

    frontends[0][0]
        .evict_by_func(Duration::ZERO, |key| Ok(key.key == 1))
        .expect("matcher never fails");

    assert!(!caches[0].contains(
        0,
        &KeyHandle::new(TreeKey {
            cache: 0,
            frontend: 0,
            key: 1,
        })
    ));
    assert!(caches[0].contains(
        0,
        &KeyHandle::new(TreeKey {
            cache: 0,
            frontend: 0,
            key: 0,
        })
    ));
    caches[0].assert_consistent();
}

#[test]
fn evict_by_func_propagates_matcher_errors() {
    let (caches, grid) = tree_caches(CacheOptions::default());
    let frontends = grid.get().expect("grid");
    run_tree_workload(frontends);

    let err = frontends[0][0]
        .evict_by_func(Duration::ZERO, |_key| Err(Error::message("matcher failed")))
        .expect_err("matcher error must surface");
    assert!(err.to_string().contains("matcher failed"));
    caches[0].assert_consistent();
}

#[test]
fn cache_wide_eviction_empties_every_frontend() {
    let (caches, grid) = tree_caches(CacheOptions::default());
    run_tree_workload(grid.get().expect("grid"));

    caches[0].evict_all(Duration::ZERO);
    wait_until(Duration::from_secs(5), || caches[0].record_count() == 0);
    assert_eq!(caches[0].memory_used(), 0);
    for cache in &caches {
        cache.assert_consistent();
    }
}

#[test]
fn memory_pressure_keeps_the_cache_minimal() {
    let (caches, grid) = tree_caches(CacheOptions {
        memory_limit: 1,
        lru_limit: Duration::ZERO,
    });
    run_tree_workload(grid.get().expect("grid"));

    caches[0].assert_consistent();
    // Freshly inserted records are never evicted by the same lookup, so up
    // to one record per frontend can linger.
    assert!(
        caches[0].record_count() <= 3,
        "stored record count not minimal: {}",
        caches[0].record_count()
    );
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn generator_errors_reach_every_waiter_and_leave_no_record() {
    let cache = Cache::new(CacheOptions::default());
    let frontend = cache.new_frontend(|key: &u32, writer: &mut RecordWriter| {
        if *key == 2 {
            thread::sleep(Duration::from_millis(10));
            return Err(Error::message("sample failure"));
        }
        serde_json::to_writer(&mut *writer, key)?;
        Ok(())
    });

    thread::scope(|scope| {
        for _ in 0..10 {
            scope.spawn(|| {
                let err = frontend.get(2).expect_err("population must fail");
                assert!(err.to_string().contains("sample failure"));
            });
        }
    });

    assert_eq!(cache.record_count(), 0);
    cache.assert_consistent();

    // Failures are not cached; the next get retries and other keys work.
    assert!(frontend.get(2).is_err());
    assert!(frontend.get(1).is_ok());
    assert_eq!(cache.record_count(), 1);
}

#[test]
fn include_errors_tear_down_the_including_record() {
    let cache = Cache::new(CacheOptions::default());
    let slot: Arc<OnceLock<Frontend<u32>>> = Arc::new(OnceLock::new());
    let frontend = cache.new_frontend({
        let slot = Arc::clone(&slot);
        move |key: &u32, writer: &mut RecordWriter| match key {
            0 => {
                writer.write_all(b"parent:")?;
                writer.include(slot.get().expect("frontend registered"), 1)
            }
            _ => Err(Error::message("leaf exploded")),
        }
    });
    let _ = slot.set(frontend.clone());

    let err = frontend.get(0).expect_err("include must fail");
    assert!(err.to_string().contains("leaf exploded"));
    assert_eq!(cache.record_count(), 0);
    cache.assert_consistent();
}

// ============================================================================
// Binding without inclusion
// ============================================================================

#[test]
fn bind_json_reads_the_bound_record() {
    let cache = Cache::new(CacheOptions::default());
    let slot: Arc<OnceLock<Frontend<u32>>> = Arc::new(OnceLock::new());
    let frontend = cache.new_frontend({
        let slot = Arc::clone(&slot);
        move |key: &u32, writer: &mut RecordWriter| match key {
            0 => {
                let inner: String =
                    writer.bind_json(slot.get().expect("frontend registered"), 1)?;
                serde_json::to_writer(&mut *writer, &inner)?;
                Ok(())
            }
            1 => {
                serde_json::to_writer(&mut *writer, "foo")?;
                Ok(())
            }
            _ => Err(Error::message("unknown key")),
        }
    });
    let _ = slot.set(frontend.clone());

    for _ in 0..2 {
        let record = frontend.get(0).expect("get");
        let value: String = record.decode_json().expect("json");
        assert_eq!(value, "foo");
    }

    // Binding registers the dependency without splicing content.
    frontend.evict(Duration::ZERO, 1);
    wait_until(Duration::from_secs(5), || cache.record_count() == 0);
    cache.assert_consistent();
}

// ============================================================================
// Limits and scheduling
// ============================================================================

#[test]
fn age_limit_evicts_stale_records() {
    let cache = Cache::new(CacheOptions {
        memory_limit: 0,
        lru_limit: Duration::from_millis(50),
    });
    let frontend = cache.new_frontend(|key: &String, writer: &mut RecordWriter| {
        serde_json::to_writer(&mut *writer, key)?;
        Ok(())
    });

    frontend.get("old".to_owned()).expect("get");
    thread::sleep(Duration::from_millis(120));
    frontend.get("new".to_owned()).expect("get");

    assert!(!cache.contains(0, &KeyHandle::new("old".to_owned())));
    assert!(cache.contains(0, &KeyHandle::new("new".to_owned())));
    cache.assert_consistent();
}

#[test]
fn scheduled_evictions_fire_after_the_delay() {
    let cache = Cache::new(CacheOptions::default());
    let frontend = cache.new_frontend(|key: &String, writer: &mut RecordWriter| {
        serde_json::to_writer(&mut *writer, key)?;
        Ok(())
    });

    frontend.get("soon".to_owned()).expect("get");
    frontend.evict(Duration::from_millis(10), "soon".to_owned());

    wait_until(Duration::from_secs(5), || cache.record_count() == 0);
    cache.assert_consistent();
}

#[test]
fn longer_delays_never_postpone_pending_evictions() {
    let cache = Cache::new(CacheOptions::default());
    let frontend = cache.new_frontend(|key: &String, writer: &mut RecordWriter| {
        serde_json::to_writer(&mut *writer, key)?;
        Ok(())
    });

    frontend.get("debounced".to_owned()).expect("get");
    frontend.evict(Duration::from_millis(10), "debounced".to_owned());
    frontend.evict(Duration::from_secs(3600), "debounced".to_owned());

    // The earliest deadline wins, so this completes in seconds, not hours.
    wait_until(Duration::from_secs(5), || cache.record_count() == 0);
    cache.assert_consistent();
}

#[test]
fn shorter_delays_replace_pending_evictions() {
    let cache = Cache::new(CacheOptions::default());
    let frontend = cache.new_frontend(|key: &String, writer: &mut RecordWriter| {
        serde_json::to_writer(&mut *writer, key)?;
        Ok(())
    });

    frontend.get("sooner".to_owned()).expect("get");
    frontend.evict(Duration::from_secs(3600), "sooner".to_owned());
    frontend.evict(Duration::from_millis(10), "sooner".to_owned());

    wait_until(Duration::from_secs(5), || cache.record_count() == 0);
    cache.assert_consistent();
}

#[test]
fn scheduled_frontend_sweep_evicts_everything() {
    let cache = Cache::new(CacheOptions::default());
    let frontend = cache.new_frontend(|key: &String, writer: &mut RecordWriter| {
        serde_json::to_writer(&mut *writer, key)?;
        Ok(())
    });

    for key_id in 0..3 {
        frontend.get(format!("key{key_id}")).expect("get");
    }
    frontend.evict_all(Duration::from_millis(10));

    wait_until(Duration::from_secs(5), || cache.record_count() == 0);
    assert_eq!(cache.memory_used(), 0);
    cache.assert_consistent();
}

// ============================================================================
// Aggregates and races
// ============================================================================

#[test]
fn identical_content_yields_identical_etags() {
    let build = || {
        let cache = Cache::new(CacheOptions::default());
        let frontend = cache.new_frontend(|_key: &String, writer: &mut RecordWriter| {
            writer.write_all(b"stable content")?;
            Ok(())
        });
        frontend.get("key".to_owned()).expect("get")
    };

    let first = build();
    let second = build();
    assert_eq!(first.sha1(), second.sha1());
    assert_eq!(first.etag(), second.etag());
    assert_eq!(first.etag_decompressed(), second.etag_decompressed());
}

#[test]
fn evicting_mid_population_skips_memory_accounting() {
    let cache = Cache::new(CacheOptions::default());
    let slot: Arc<OnceLock<Frontend<String>>> = Arc::new(OnceLock::new());
    let frontend = cache.new_frontend({
        let slot = Arc::clone(&slot);
        move |key: &String, writer: &mut RecordWriter| {
            writer.write_all(key.as_bytes())?;
            // The slot is reassigned under us before population finishes.
            slot.get()
                .expect("frontend registered")
                .evict(Duration::ZERO, key.clone());
            Ok(())
        }
    });
    let _ = slot.set(frontend.clone());

    let record = frontend.get("gone".to_owned()).expect("get");
    let mut body = Vec::new();
    let mut reader = record.decompress();
    reader.read_to_end(&mut body).expect("read");
    assert_eq!(body, b"gone");

    // The populated record never made it into the accounting.
    assert_eq!(cache.record_count(), 0);
    assert_eq!(cache.memory_used(), 0);
    cache.assert_consistent();
}

#[test]
fn streams_survive_eviction_of_their_record() {
    let cache = Cache::new(CacheOptions::default());
    let frontend = cache.new_frontend(|key: &String, writer: &mut RecordWriter| {
        writer.write_all(key.as_bytes())?;
        Ok(())
    });

    let record = frontend.get("persistent".to_owned()).expect("get");
    frontend.evict(Duration::ZERO, "persistent".to_owned());
    assert_eq!(cache.record_count(), 0);

    // The handle still owns the data.
    let mut body = Vec::new();
    let mut reader = record.decompress();
    reader.read_to_end(&mut body).expect("read");
    assert_eq!(body, b"persistent");
}
