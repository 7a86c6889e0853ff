//! Concurrent writer safety: many threads inserting into one collection
//! must never lose or duplicate a write.

use serde_json::json;
use shelfdb::{Config, Database};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

#[test]
fn ten_threads_twenty_inserts_each_yields_exact_union() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(Config::at(dir.path())).unwrap());
    db.create_collection("users").unwrap();

    let num_threads = 10;
    let inserts_per_thread = 20;

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..inserts_per_thread {
                    let id = format!("t{}_{}", t, i);
                    let mut txn = db.begin();
                    db.insert(&mut txn, "users", &id, json!({"thread": t, "n": i}).as_object().unwrap().clone())
                        .unwrap();
                    db.commit(&mut txn).unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let mut seen = HashSet::new();
    db.scan_collection("users", |id, _doc| {
        seen.insert(id.clone());
        shelfdb::ScanControl::Continue
    })
    .unwrap();

    assert_eq!(seen.len(), num_threads * inserts_per_thread);
    for t in 0..num_threads {
        for i in 0..inserts_per_thread {
            assert!(seen.contains(&format!("t{}_{}", t, i)));
        }
    }
}

#[test]
fn writes_to_one_collection_do_not_perturb_another() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(Config::at(dir.path())).unwrap();
    db.create_collection("a").unwrap();
    db.create_collection("b").unwrap();

    let mut seed = db.begin();
    db.insert(&mut seed, "b", "y1", json!({"v": 1}).as_object().unwrap().clone())
        .unwrap();
    db.commit(&mut seed).unwrap();

    let before = db.storage().scan_to_vec("b").unwrap();

    for i in 0..50 {
        let mut txn = db.begin();
        db.insert(&mut txn, "a", &format!("x{}", i), json!({"v": i}).as_object().unwrap().clone())
            .unwrap();
        db.commit(&mut txn).unwrap();
    }

    let after = db.storage().scan_to_vec("b").unwrap();
    assert_eq!(before, after);
}

#[test]
fn randomized_mixed_workload_matches_tracked_final_state() {
    use rand::Rng;
    use std::collections::HashMap;

    let dir = TempDir::new().unwrap();
    let db = Database::open(Config::at(dir.path())).unwrap();
    db.create_collection("docs").unwrap();

    let mut rng = rand::thread_rng();
    let mut live: HashMap<String, i64> = HashMap::new();
    let mut next_id = 0u64;

    for _ in 0..300 {
        let roll: f64 = rng.gen();
        if roll < 0.6 || live.is_empty() {
            let id = format!("d{}", next_id);
            next_id += 1;
            let v = rng.gen_range(0..1000);
            let mut txn = db.begin();
            db.insert(&mut txn, "docs", &id, json!({"v": v}).as_object().unwrap().clone())
                .unwrap();
            db.commit(&mut txn).unwrap();
            live.insert(id, v);
        } else if roll < 0.85 {
            let keys: Vec<_> = live.keys().cloned().collect();
            let id = &keys[rng.gen_range(0..keys.len())];
            let v = rng.gen_range(0..1000);
            let mut txn = db.begin();
            db.update(&mut txn, "docs", id, json!({"v": v}).as_object().unwrap().clone())
                .unwrap();
            db.commit(&mut txn).unwrap();
            live.insert(id.clone(), v);
        } else {
            let keys: Vec<_> = live.keys().cloned().collect();
            let id = keys[rng.gen_range(0..keys.len())].clone();
            let mut txn = db.begin();
            db.delete(&mut txn, "docs", &id).unwrap();
            db.commit(&mut txn).unwrap();
            live.remove(&id);
        }
    }

    let mut stored: Vec<_> = db.storage().scan_to_vec("docs").unwrap();
    stored.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(stored.len(), live.len());
    for (id, doc) in stored {
        let expected = live.get(&id).unwrap();
        assert_eq!(doc.get("v").and_then(|v| v.as_i64()), Some(*expected));
    }
}
