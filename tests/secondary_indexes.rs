use isam_tree::{
    BuildOptions, Error, Isam, KeyDescriptor, KeyPart, LockMode, OpenOptions, PartType,
    ReadFlags, ReadMode,
};
use test_log::test;

fn row(name: &str, city: &str) -> Vec<u8> {
    let mut row = vec![b' '; 32];
    row[..name.len()].copy_from_slice(name.as_bytes());
    row[8..8 + city.len()].copy_from_slice(city.as_bytes());
    row
}

fn name_key() -> KeyDescriptor {
    KeyDescriptor::unique(KeyPart::ascending(0, 8, PartType::Char))
}

fn city_key() -> KeyDescriptor {
    KeyDescriptor::with_duplicates(KeyPart::ascending(8, 8, PartType::Char))
}

#[test]
fn add_index_backfills_existing_rows() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("t");

    let mut engine = Isam::new();

    let mut opts = BuildOptions::new(32);
    opts.lock = LockMode::Exclusive;
    let table = engine.build(&base, &opts, &name_key())?;

    engine.insert(table, &row("delia___", "oslo____"))?;
    engine.insert(table, &row("arthur__", "tallinn_"))?;
    engine.insert(table, &row("carol___", "oslo____"))?;

    engine.add_index(table, &city_key())?;

    // traversal over the new key orders by city, then insertion
    engine.start(table, &city_key(), 0, &row("", ""), ReadMode::First)?;

    let mut names = vec![];
    let mut buffer = vec![];
    while engine
        .read(table, &mut buffer, ReadMode::Next, ReadFlags::none())
        .is_ok()
    {
        names.push(buffer[..8].to_vec());
    }

    assert_eq!(
        vec![
            b"delia___".to_vec(),
            b"carol___".to_vec(),
            b"arthur__".to_vec(),
        ],
        names
    );

    engine.close(table)?;
    Ok(())
}

#[test]
fn add_index_requires_exclusive_lock() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();

    let table = engine.build(&dir.path().join("t"), &BuildOptions::new(32), &name_key())?;

    assert!(matches!(
        engine.add_index(table, &city_key()),
        Err(Error::NotExclusive)
    ));

    engine.close(table)?;
    Ok(())
}

#[test]
fn adding_the_same_key_twice_fails() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();

    let mut opts = BuildOptions::new(32);
    opts.lock = LockMode::Exclusive;
    let table = engine.build(&dir.path().join("t"), &opts, &name_key())?;

    engine.add_index(table, &city_key())?;
    assert!(matches!(
        engine.add_index(table, &city_key()),
        Err(Error::KeyExists)
    ));

    Ok(())
}

#[test]
fn drop_index_frees_the_tree_and_forgets_the_key() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let base = dir.path().join("t");

    let mut engine = Isam::new();

    let mut opts = BuildOptions::new(32);
    opts.lock = LockMode::Exclusive;
    let table = engine.build(&base, &opts, &name_key())?;

    for i in 0..200u32 {
        engine.insert(table, &row(&format!("n{i:06}_"), &format!("c{:06}_", i % 10)))?;
    }

    engine.add_index(table, &city_key())?;
    engine.drop_index(table, &city_key())?;

    // the key is gone
    assert!(matches!(
        engine.start(table, &city_key(), 0, &row("", ""), ReadMode::First),
        Err(Error::BadKey)
    ));

    // the primary still works end to end
    let mut buffer = row("n000007_", "");
    engine.read(table, &mut buffer, ReadMode::Equal, ReadFlags::none())?;
    assert_eq!(b"c000007_", &buffer[8..16]);

    engine.close(table)?;

    // a fresh open sees one key only
    let table = engine.open(
        &base,
        &OpenOptions {
            lock: LockMode::Exclusive,
            ..OpenOptions::default()
        },
    )?;
    assert_eq!(1, engine.table_info(table)?.key_count);

    engine.close(table)?;
    Ok(())
}

#[test]
fn the_primary_key_cannot_be_dropped() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();

    let mut opts = BuildOptions::new(32);
    opts.lock = LockMode::Exclusive;
    let table = engine.build(&dir.path().join("t"), &opts, &name_key())?;

    assert!(matches!(
        engine.drop_index(table, &name_key()),
        Err(Error::PrimaryKey)
    ));

    Ok(())
}

#[test]
fn secondary_keys_follow_updates() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();

    let mut opts = BuildOptions::new(32);
    opts.lock = LockMode::Exclusive;
    let table = engine.build(&dir.path().join("t"), &opts, &name_key())?;

    engine.add_index(table, &city_key())?;

    engine.insert(table, &row("arthur__", "tallinn_"))?;
    engine.update(table, &row("arthur__", "vilnius_"))?;

    // the old city no longer matches
    assert!(matches!(
        engine.start(table, &city_key(), 0, &row("", "tallinn_"), ReadMode::Equal),
        Err(Error::NoRecord)
    ));

    engine.start(table, &city_key(), 0, &row("", "vilnius_"), ReadMode::Equal)?;

    let mut buffer = vec![];
    engine.read(table, &mut buffer, ReadMode::Next, ReadFlags::none())?;
    assert_eq!(row("arthur__", "vilnius_"), buffer);

    engine.close(table)?;
    Ok(())
}
