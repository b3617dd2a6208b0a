use isam_tree::{
    BuildOptions, Error, Isam, KeyDescriptor, KeyPart, LockMode, PartType, ReadFlags, ReadMode,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use test_log::test;

fn row32(key: u32, version: u32) -> Vec<u8> {
    let mut row = vec![b' '; 32];
    row[..8].copy_from_slice(format!("K{key:07}").as_bytes());
    row[8..16].copy_from_slice(format!("V{version:07}").as_bytes());
    row
}

fn unique_key8() -> KeyDescriptor {
    KeyDescriptor::unique(KeyPart::ascending(0, 8, PartType::Char))
}

fn version_key() -> KeyDescriptor {
    KeyDescriptor::with_duplicates(KeyPart::ascending(8, 8, PartType::Char))
}

/// Drives a random insert/update/delete mix against a model `BTreeMap` and
/// checks the table agrees with the model through both indexes.
#[test]
fn random_mutations_agree_with_a_model() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();

    let mut opts = BuildOptions::new(32);
    opts.lock = LockMode::Exclusive;
    opts.node_size = 512;

    let table = engine.build(&dir.path().join("t"), &opts, &unique_key8())?;
    engine.add_index(table, &version_key())?;

    let mut rng = StdRng::seed_from_u64(0xD1CE);
    let mut model: BTreeMap<u32, u32> = BTreeMap::new();

    for round in 0..2_000u32 {
        let key = rng.random_range(0..300);

        match rng.random_range(0..3) {
            0 => {
                let result = engine.insert(table, &row32(key, round));
                if model.contains_key(&key) {
                    assert!(matches!(result, Err(Error::Duplicate)));
                } else {
                    result?;
                    model.insert(key, round);
                }
            }
            1 => {
                let result = engine.update(table, &row32(key, round));
                if model.contains_key(&key) {
                    result?;
                    model.insert(key, round);
                } else {
                    assert!(matches!(result, Err(Error::NoRecord)));
                }
            }
            _ => {
                let result = engine.delete(table, &row32(key, 0));
                if model.remove(&key).is_some() {
                    result?;
                } else {
                    assert!(matches!(result, Err(Error::NoRecord)));
                }
            }
        }
    }

    assert!(!model.is_empty(), "workload should leave rows behind");

    // full forward scan over the primary matches the model exactly
    let mut buffer = vec![];
    let mut scanned = vec![];
    engine.read(table, &mut buffer, ReadMode::First, ReadFlags::none())?;
    scanned.push(buffer.clone());
    while engine
        .read(table, &mut buffer, ReadMode::Next, ReadFlags::none())
        .is_ok()
    {
        scanned.push(buffer.clone());
    }

    let expected: Vec<_> = model.iter().map(|(k, v)| row32(*k, *v)).collect();
    assert_eq!(expected, scanned);

    // every model row is also reachable by an exact key read
    for (key, version) in &model {
        let mut buffer = row32(*key, 0);
        engine.read(table, &mut buffer, ReadMode::Equal, ReadFlags::none())?;
        assert_eq!(row32(*key, *version), buffer);
    }

    // the secondary index sees exactly the same set of rows
    engine.start(table, &version_key(), 0, &row32(0, 0), ReadMode::First)?;
    let mut via_version = 0;
    while engine
        .read(table, &mut buffer, ReadMode::Next, ReadFlags::none())
        .is_ok()
    {
        via_version += 1;
    }
    assert_eq!(model.len(), via_version);

    engine.close(table)?;
    Ok(())
}
