use isam_tree::{
    BuildOptions, Error, Isam, KeyDescriptor, KeyPart, PartType, ReadFlags, ReadMode,
};
use test_log::test;

fn row32(key: &str) -> Vec<u8> {
    let mut row = vec![b' '; 32];
    row[..key.len()].copy_from_slice(key.as_bytes());
    row
}

fn unique_key8() -> KeyDescriptor {
    KeyDescriptor::unique(KeyPart::ascending(0, 8, PartType::Char))
}

fn populated(dir: &std::path::Path) -> isam_tree::Result<(Isam, isam_tree::TableHandle)> {
    let mut engine = Isam::new();
    let table = engine.build(&dir.join("t"), &BuildOptions::new(32), &unique_key8())?;

    for key in ["AB000001", "AB000002", "AC000001", "AD000001"] {
        engine.insert(table, &row32(key))?;
    }

    Ok((engine, table))
}

#[test]
fn start_then_next_returns_the_sought_row() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut engine, table) = populated(dir.path())?;

    // position on the key without fetching, then read it with Next
    engine.start(table, &unique_key8(), 0, &row32("AC000001"), ReadMode::Equal)?;

    let mut buffer = vec![];
    engine.read(table, &mut buffer, ReadMode::Next, ReadFlags::none())?;
    assert_eq!(row32("AC000001"), buffer);

    // the following Next moves on as usual
    engine.read(table, &mut buffer, ReadMode::Next, ReadFlags::none())?;
    assert_eq!(row32("AD000001"), buffer);

    engine.close(table)?;
    Ok(())
}

#[test]
fn partial_key_equal_matches_a_prefix() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut engine, table) = populated(dir.path())?;

    // two keys share the 2-byte prefix "AB"; the seek lands on the first
    engine.start(table, &unique_key8(), 2, &row32("AB______"), ReadMode::Equal)?;

    let mut buffer = vec![];
    engine.read(table, &mut buffer, ReadMode::Next, ReadFlags::none())?;
    assert_eq!(row32("AB000001"), buffer);

    // a prefix nothing carries
    assert!(matches!(
        engine.start(table, &unique_key8(), 2, &row32("ZZ______"), ReadMode::Equal),
        Err(Error::NoRecord)
    ));

    engine.close(table)?;
    Ok(())
}

#[test]
fn partial_key_greater_skips_the_whole_prefix() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut engine, table) = populated(dir.path())?;

    // everything starting "AB" is skipped, not just the first match
    engine.start(table, &unique_key8(), 2, &row32("AB______"), ReadMode::Greater)?;

    let mut buffer = vec![];
    engine.read(table, &mut buffer, ReadMode::Next, ReadFlags::none())?;
    assert_eq!(row32("AC000001"), buffer);

    engine.close(table)?;
    Ok(())
}

#[test]
fn partial_key_greater_or_equal_includes_the_prefix() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut engine, table) = populated(dir.path())?;

    engine.start(
        table,
        &unique_key8(),
        2,
        &row32("AC______"),
        ReadMode::GreaterOrEqual,
    )?;

    let mut buffer = vec![];
    engine.read(table, &mut buffer, ReadMode::Next, ReadFlags::none())?;
    assert_eq!(row32("AC000001"), buffer);

    engine.close(table)?;
    Ok(())
}

#[test]
fn start_with_an_unknown_key_shape_fails() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut engine, table) = populated(dir.path())?;

    let foreign = KeyDescriptor::unique(KeyPart::ascending(4, 8, PartType::Char));
    assert!(matches!(
        engine.start(table, &foreign, 0, &row32(""), ReadMode::Equal),
        Err(Error::BadKey)
    ));

    engine.close(table)?;
    Ok(())
}

#[test]
fn start_first_and_prev_walks_backwards() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut engine, table) = populated(dir.path())?;

    engine.start(table, &unique_key8(), 0, &row32(""), ReadMode::Last)?;

    let mut buffer = vec![];
    engine.read(table, &mut buffer, ReadMode::Current, ReadFlags::none())?;
    assert_eq!(row32("AD000001"), buffer);

    engine.read(table, &mut buffer, ReadMode::Prev, ReadFlags::none())?;
    assert_eq!(row32("AC000001"), buffer);

    engine.close(table)?;
    Ok(())
}
