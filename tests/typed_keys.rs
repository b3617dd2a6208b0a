use isam_tree::{
    BuildOptions, Isam, KeyDescriptor, KeyPart, PartType, ReadFlags, ReadMode,
};
use test_log::test;

// row layout: [0..4) i32 BE account, [4..12) name, [12..20) f64 BE balance
fn row(account: i32, name: &str, balance: f64) -> Vec<u8> {
    let mut row = vec![b' '; 32];
    row[..4].copy_from_slice(&account.to_be_bytes());
    row[4..4 + name.len()].copy_from_slice(name.as_bytes());
    row[12..20].copy_from_slice(&balance.to_be_bytes());
    row
}

fn account_key() -> KeyDescriptor {
    KeyDescriptor::unique(KeyPart::ascending(0, 4, PartType::Int32))
}

#[test]
fn signed_integers_order_correctly() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();

    let table = engine.build(&dir.path().join("t"), &BuildOptions::new(32), &account_key())?;

    for account in [5, -3, 0, i32::MIN, i32::MAX, -100] {
        engine.insert(table, &row(account, "x", 0.0))?;
    }

    let mut seen = vec![];
    let mut buffer = vec![];
    engine.read(table, &mut buffer, ReadMode::First, ReadFlags::none())?;
    seen.push(i32::from_be_bytes(buffer[..4].try_into().unwrap()));
    while engine
        .read(table, &mut buffer, ReadMode::Next, ReadFlags::none())
        .is_ok()
    {
        seen.push(i32::from_be_bytes(buffer[..4].try_into().unwrap()));
    }

    assert_eq!(vec![i32::MIN, -100, -3, 0, 5, i32::MAX], seen);

    engine.close(table)?;
    Ok(())
}

#[test]
fn descending_float_key_reverses_the_order() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();

    let balance_key =
        KeyDescriptor::with_duplicates(KeyPart::descending(12, 8, PartType::Float64));

    let table = engine.build(&dir.path().join("t"), &BuildOptions::new(32), &balance_key)?;

    for (i, balance) in [-2.5, 10.0, 0.0, 3.25].into_iter().enumerate() {
        engine.insert(table, &row(i as i32, "x", balance))?;
    }

    let mut seen = vec![];
    let mut buffer = vec![];
    engine.read(table, &mut buffer, ReadMode::First, ReadFlags::none())?;
    seen.push(f64::from_be_bytes(buffer[12..20].try_into().unwrap()));
    while engine
        .read(table, &mut buffer, ReadMode::Next, ReadFlags::none())
        .is_ok()
    {
        seen.push(f64::from_be_bytes(buffer[12..20].try_into().unwrap()));
    }

    assert_eq!(vec![10.0, 3.25, 0.0, -2.5], seen);

    engine.close(table)?;
    Ok(())
}

#[test]
fn multi_part_key_orders_by_part_sequence() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();

    // name first, then account as tie break
    let compound = KeyDescriptor {
        parts: vec![
            KeyPart::ascending(4, 8, PartType::Char),
            KeyPart::ascending(0, 4, PartType::Int32),
        ],
        ..KeyDescriptor::default()
    };

    let table = engine.build(&dir.path().join("t"), &BuildOptions::new(32), &compound)?;

    engine.insert(table, &row(2, "bbb", 0.0))?;
    engine.insert(table, &row(1, "bbb", 0.0))?;
    engine.insert(table, &row(9, "aaa", 0.0))?;

    let mut seen = vec![];
    let mut buffer = vec![];
    engine.read(table, &mut buffer, ReadMode::First, ReadFlags::none())?;
    seen.push((buffer[4..7].to_vec(), i32::from_be_bytes(buffer[..4].try_into().unwrap())));
    while engine
        .read(table, &mut buffer, ReadMode::Next, ReadFlags::none())
        .is_ok()
    {
        seen.push((buffer[4..7].to_vec(), i32::from_be_bytes(buffer[..4].try_into().unwrap())));
    }

    assert_eq!(
        vec![
            (b"aaa".to_vec(), 9),
            (b"bbb".to_vec(), 1),
            (b"bbb".to_vec(), 2),
        ],
        seen
    );

    engine.close(table)?;
    Ok(())
}

#[test]
fn null_suppressed_keys_skip_blank_values() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();

    let mut opts = BuildOptions::new(32);
    opts.lock = isam_tree::LockMode::Exclusive;

    let table = engine.build(&dir.path().join("t"), &opts, &account_key())?;

    let name_key = KeyDescriptor {
        parts: vec![KeyPart::ascending(4, 8, PartType::Char)],
        duplicates: true,
        null_suppress: true,
        ..KeyDescriptor::default()
    };
    engine.add_index(table, &name_key)?;

    engine.insert(table, &row(1, "carol", 0.0))?;
    engine.insert(table, &row(2, "", 0.0))?; // blank name: no entry

    // the suppressed row is invisible through the name index
    engine.start(table, &name_key, 0, &row(0, "", 0.0), ReadMode::First)?;

    let mut buffer = vec![];
    engine.read(table, &mut buffer, ReadMode::Next, ReadFlags::none())?;
    assert_eq!(1, i32::from_be_bytes(buffer[..4].try_into().unwrap()));

    assert!(engine
        .read(table, &mut buffer, ReadMode::Next, ReadFlags::none())
        .is_err());

    // but fully visible through the primary
    engine.start(table, &account_key(), 0, &row(0, "", 0.0), ReadMode::First)?;
    let mut count = 0;
    while engine
        .read(table, &mut buffer, ReadMode::Next, ReadFlags::none())
        .is_ok()
    {
        count += 1;
    }
    assert_eq!(2, count);

    engine.close(table)?;
    Ok(())
}
