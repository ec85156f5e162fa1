//! Readers racing generation publishes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rowcache::codec::{encode_int_key, frame_payload, IndexKey};
use rowcache::source::SourceRow;
use rowcache::table::{
    Generation, GenerationBuilder, IndexLookup, KeyType, TableRegistry, TableSpec,
};
use rowcache::Arena;

const KEYS: i64 = 64;
const PUBLISHES: u64 = 200;
const READERS: usize = 4;

fn spec() -> TableSpec {
    TableSpec::new("t", Duration::from_secs(60)).with_index("id", KeyType::Int)
}

fn generation(spec: &TableSpec, sequence: u64) -> Generation {
    let mut builder =
        GenerationBuilder::new(spec, KEYS as u64, Arena::with_capacity(4096)).unwrap();
    for key in 0..KEYS {
        builder
            .push_row(SourceRow {
                keys: vec![Some(IndexKey::Int(key))],
                value: format!("{sequence}:{key}").into_bytes(),
            })
            .unwrap();
    }
    builder.finish(sequence)
}

#[test]
fn test_readers_never_see_mixed_generations() {
    let registry = Arc::new(TableRegistry::new(vec![spec()]).unwrap());
    let entry_spec = Arc::clone(registry.get(0).unwrap().spec());
    registry.get(0).unwrap().publish(generation(&entry_spec, 1));

    let stop = Arc::new(AtomicBool::new(false));
    let snapshots = Arc::new(AtomicU64::new(0));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            let snapshots = Arc::clone(&snapshots);
            thread::spawn(move || {
                let entry = registry.get(0).unwrap();
                let mut last_sequence = 0;
                while !stop.load(Ordering::Acquire) {
                    let pinned = entry.pin().unwrap();
                    let sequence = pinned.sequence();
                    assert!(sequence >= last_sequence, "sequence went backwards");
                    last_sequence = sequence;

                    for key in 0..KEYS {
                        let IndexLookup::Found(frame) = pinned.lookup(0, &encode_int_key(key))
                        else {
                            panic!("key {key} missing from generation {sequence}");
                        };
                        let expected = format!("{sequence}:{key}");
                        assert_eq!(frame_payload(frame), Some(expected.as_bytes()));
                    }
                    drop(pinned);
                    snapshots.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    let entry = registry.get(0).unwrap();
    for sequence in 2..=PUBLISHES {
        let retired = entry.publish(generation(&entry_spec, sequence));
        assert_eq!(retired, Some(sequence - 1));
        if sequence % 16 == 0 {
            thread::yield_now();
        }
    }
    // Let readers observe the final generation at least once.
    while snapshots.load(Ordering::Relaxed) < READERS as u64 * 4 {
        thread::yield_now();
    }
    stop.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }

    let cell = entry.cell();
    assert_eq!(cell.published_count(), PUBLISHES);
    assert_eq!(cell.retired_count(), PUBLISHES - 1);
    assert_eq!(entry.pin().unwrap().sequence(), PUBLISHES);

    // Nobody is pinned any more, so one more epoch bump frees everything retired.
    registry.epoch().bump_current_epoch();
    assert_eq!(cell.freed_count(), cell.retired_count());
    assert_eq!(registry.epoch().pending_actions(), 0);
}

#[test]
fn test_pinned_reader_keeps_old_bytes() {
    let registry = Arc::new(TableRegistry::new(vec![spec()]).unwrap());
    let entry = registry.get(0).unwrap();
    let spec = Arc::clone(entry.spec());
    entry.publish(generation(&spec, 1));

    let pinned = entry.pin().unwrap();
    let IndexLookup::Found(before) = pinned.lookup(0, &encode_int_key(5)) else {
        panic!("key 5 missing");
    };
    let before = before.to_vec();

    let publisher = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            let entry = registry.get(0).unwrap();
            let spec = Arc::clone(entry.spec());
            entry.publish(generation(&spec, 2));
            entry.cell().freed_count()
        })
    };
    let freed_while_pinned = publisher.join().unwrap();
    assert_eq!(freed_while_pinned, 0);

    let IndexLookup::Found(after) = pinned.lookup(0, &encode_int_key(5)) else {
        panic!("key 5 missing after publish");
    };
    assert_eq!(after, before.as_slice());
    assert_eq!(frame_payload(after), Some(&b"1:5"[..]));
    drop(pinned);

    assert_eq!(entry.pin().unwrap().sequence(), 2);
    registry.epoch().bump_current_epoch();
    assert_eq!(entry.cell().freed_count(), 1);
}
