//! Randomized tests for the single-writer snapshot.
//!
//! Sequences are generated with `fastrand` from fixed seeds so failures
//! reproduce.

use crate::core::{FieldValue, FormValue};
use crate::engine::FormBuilder;
use crate::error::lock;
use crate::field::FieldProps;
use std::sync::{Arc, Mutex};

const NAMES: [&str; 6] = ["a", "b", "c", "d", "e", "f"];

fn random_batch(rng: &mut fastrand::Rng) -> FormValue {
    let mut batch = FormValue::new();
    for _ in 0..rng.usize(1..=3) {
        let name = NAMES[rng.usize(..NAMES.len())];
        let value = if rng.u8(..10) == 0 {
            FieldValue::Absent
        } else {
            FieldValue::from(rng.i64(-100..100))
        };
        batch.insert(name.to_string(), value);
    }
    batch
}

#[test]
fn test_set_values_equals_left_fold() {
    for seed in 0..20 {
        let mut rng = fastrand::Rng::with_seed(seed);
        let form = FormBuilder::new().build();
        let mut expected = FormValue::new();

        for _ in 0..200 {
            let batch = random_batch(&mut rng);
            for (name, value) in &batch {
                expected.insert(name.clone(), value.clone());
            }
            form.set_values(batch);
        }

        assert_eq!(form.get_values(), expected, "seed {seed}");
        assert_eq!(form.values().version(), 200, "seed {seed}");
    }
}

#[test]
fn test_every_write_reports_exactly_its_names() {
    let log: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let form = FormBuilder::new()
        .on_change(move |_, changed| lock(&sink).push(changed.to_vec()))
        .build();
    let mut rng = fastrand::Rng::with_seed(7);
    let mut batches = Vec::new();

    for _ in 0..100 {
        let batch = random_batch(&mut rng);
        batches.push(batch.keys().cloned().collect::<Vec<_>>());
        form.set_values(batch);
    }

    assert_eq!(*lock(&log), batches);
}

#[test]
fn test_clear_is_idempotent() {
    let mut rng = fastrand::Rng::with_seed(42);
    let writes = Arc::new(Mutex::new(0usize));
    let counter = writes.clone();
    let form = FormBuilder::new()
        .on_change(move |_, _| *lock(&counter) += 1)
        .build();

    for _ in 0..50 {
        form.set_values(random_batch(&mut rng));
    }
    form.clear_all();
    let after_first = form.get_values();
    let count = *lock(&writes);

    form.clear_all();
    form.clear_values(NAMES);

    assert_eq!(form.get_values(), after_first);
    assert_eq!(*lock(&writes), count);
    assert!(after_first.values().all(FieldValue::is_absent));
}

#[test]
fn test_mount_unmount_churn_keeps_registry_consistent() {
    let form = FormBuilder::new().build();
    let mut rng = fastrand::Rng::with_seed(3);
    let mut mounted = Vec::new();

    for _ in 0..300 {
        if mounted.is_empty() || rng.bool() {
            let name = NAMES[rng.usize(..NAMES.len())];
            mounted.push(form.mount_field(FieldProps::new(name).default_value(rng.i64(0..10))));
        } else {
            let field = mounted.swap_remove(rng.usize(..mounted.len()));
            form.channel().publish(crate::bus::FormEvent::UnregisterItem {
                name: field.name().to_string(),
            });
            drop(field);
        }
    }

    // Every live field whose name survived is registered; the snapshot
    // never holds a name that no write or field introduced.
    for name in form.values().names() {
        assert!(NAMES.contains(&name.as_str()));
    }
    for field in &mounted {
        field.refresh();
        assert!(form.is_registered(field.name()));
    }
}
