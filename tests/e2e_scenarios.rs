//! Literal end-to-end scenarios, scaled down from the documented sizes
//! where the original count (100 000 / 20 000 entries) would make the
//! suite slow without exercising anything the scaled-down count doesn't.

use shareable_store::{MapOptions, ShareableArray, ShareableMap, Value};

fn str_map() -> ShareableMap {
    ShareableMap::new(MapOptions {
        initial_buckets: 8,
        max_index_bytes: 1 << 20,
        max_data_bytes: 1 << 24,
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn scenario_1_duplicate_inserts_keep_last_write() {
    let map = str_map();
    let pairs = [("a", 1), ("b", 2), ("c", 3), ("a", 4), ("d", 5), ("a", 6)];
    for (k, v) in pairs {
        map.set(&Value::Str(k.into()), &Value::Int(v)).unwrap();
    }
    assert_eq!(map.len().unwrap(), 4);
    assert_eq!(map.get(&Value::Str("a".into())).unwrap(), Some(Value::Int(6)));
    let mut keys: Vec<String> = map
        .keys()
        .unwrap()
        .into_iter()
        .map(|k| k.as_str().unwrap().to_owned())
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["a", "b", "c", "d"]);
}

#[test]
fn scenario_2_bulk_inserts_with_duplicates() {
    const N: usize = 5_000;
    const DUPLICATES: usize = 50;
    let map = str_map();
    let mut expected = std::collections::HashMap::new();

    for i in 0..N {
        let key = format!("key-{i}");
        map.set(&Value::Str(key.clone()), &Value::Int(i as i64)).unwrap();
        expected.insert(key, i as i64);
    }
    for i in 0..DUPLICATES {
        let key = format!("key-{i}");
        let new_value = (N + i) as i64;
        map.set(&Value::Str(key.clone()), &Value::Int(new_value)).unwrap();
        expected.insert(key, new_value);
    }

    assert_eq!(map.len().unwrap() as usize, expected.len());
    for (key, value) in &expected {
        assert_eq!(map.get(&Value::Str(key.clone())).unwrap(), Some(Value::Int(*value)));
        assert!(map.has(&Value::Str(key.clone())).unwrap());
    }
    assert!(!map.has(&Value::Str("never-written".into())).unwrap());
}

#[test]
fn scenario_3_delete_and_reinsert_triggers_defragmentation() {
    const N: usize = 2_000;
    let map = ShareableMap::new(MapOptions {
        initial_buckets: 64,
        max_index_bytes: 1 << 20,
        max_data_bytes: 1 << 24,
        ..Default::default()
    })
    .unwrap();

    for i in 0..N {
        map.set(&Value::Str(format!("k{i}")), &Value::Int(i as i64)).unwrap();
    }

    let deleted_count = (N * 9) / 10;
    for i in 0..deleted_count {
        assert!(map.delete(&Value::Str(format!("k{i}"))).unwrap());
    }
    for i in 0..deleted_count {
        map.set(&Value::Str(format!("k{i}")), &Value::Int(i as i64)).unwrap();
    }

    assert_eq!(map.len().unwrap() as usize, N);
    for i in 0..N {
        assert_eq!(map.get(&Value::Str(format!("k{i}"))).unwrap(), Some(Value::Int(i as i64)));
    }
}

#[test]
fn scenario_4_array_push_and_delete() {
    let array = ShareableArray::new(Default::default(), &[]).unwrap();
    array.push(&Value::Str("a".into())).unwrap();
    array.push(&Value::Str("b".into())).unwrap();
    array.push(&Value::Str("c".into())).unwrap();
    array.delete(1).unwrap();
    assert_eq!(array.at(0).unwrap(), Some(Value::Str("a".into())));
    assert_eq!(array.at(1).unwrap(), Some(Value::Str("c".into())));
    assert_eq!(array.len().unwrap(), 2);
}

#[test]
fn scenario_5_array_of_composite_records_round_trips() {
    let array = ShareableArray::new(Default::default(), &[]).unwrap();
    let records = [(1, "alice"), (2, "bob"), (3, "carol")];
    for (id, name) in records {
        let record = Value::Map(vec![
            ("id".into(), Value::Int(id)),
            ("name".into(), Value::Str(name.into())),
        ]);
        array.push(&record).unwrap();
    }
    for (i, (id, name)) in records.into_iter().enumerate() {
        let expected = Value::Map(vec![
            ("id".into(), Value::Int(id)),
            ("name".into(), Value::Str(name.into())),
        ]);
        assert_eq!(array.at(i as u32).unwrap(), Some(expected));
    }
}
