use isam_tree::{
    BuildOptions, Error, Isam, KeyDescriptor, KeyPart, PartType, ReadFlags, ReadMode,
};
use test_log::test;

fn var_row(key: &str, body_len: usize) -> Vec<u8> {
    let mut row = vec![b' '; 16];
    row[..key.len()].copy_from_slice(key.as_bytes());
    row.extend((0..body_len).map(|i| (i % 251) as u8));
    row
}

fn options() -> BuildOptions {
    let mut opts = BuildOptions::new(16);
    opts.max_row_len = Some(8_192);
    opts
}

fn key() -> KeyDescriptor {
    KeyDescriptor::unique(KeyPart::ascending(0, 8, PartType::Char))
}

#[test]
fn long_rows_roundtrip_through_overflow() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();

    let table = engine.build(&dir.path().join("t"), &options(), &key())?;

    let short = var_row("K1______", 0);
    let long = var_row("K2______", 6_000);

    engine.insert(table, &short)?;
    engine.insert(table, &long)?;

    let mut buffer = var_row("K2______", 0);
    engine.read(table, &mut buffer, ReadMode::Equal, ReadFlags::none())?;
    assert_eq!(long, buffer);

    let mut buffer = var_row("K1______", 0);
    engine.read(table, &mut buffer, ReadMode::Equal, ReadFlags::none())?;
    assert_eq!(short, buffer);

    engine.close(table)?;
    Ok(())
}

#[test]
fn rows_can_grow_and_shrink_in_place() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();

    let table = engine.build(&dir.path().join("t"), &options(), &key())?;

    engine.insert(table, &var_row("K1______", 40))?;

    engine.update(table, &var_row("K1______", 5_000))?;
    let mut buffer = var_row("K1______", 0);
    engine.read(table, &mut buffer, ReadMode::Equal, ReadFlags::none())?;
    assert_eq!(var_row("K1______", 5_000), buffer);

    engine.update(table, &var_row("K1______", 8))?;
    let mut buffer = var_row("K1______", 0);
    engine.read(table, &mut buffer, ReadMode::Equal, ReadFlags::none())?;
    assert_eq!(var_row("K1______", 8), buffer);

    engine.close(table)?;
    Ok(())
}

#[test]
fn deleting_a_long_row_recycles_its_overflow() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();

    let table = engine.build(&dir.path().join("t"), &options(), &key())?;

    engine.insert(table, &var_row("K1______", 6_000))?;
    let nodes_after_insert = engine.table_info(table)?.node_count;

    engine.delete(table, &var_row("K1______", 0))?;

    // a fresh long row reuses the freed overflow nodes instead of growing
    // the index file
    engine.insert(table, &var_row("K2______", 6_000))?;

    assert_eq!(nodes_after_insert, engine.table_info(table)?.node_count);

    let mut buffer = var_row("K2______", 0);
    engine.read(table, &mut buffer, ReadMode::Equal, ReadFlags::none())?;
    assert_eq!(var_row("K2______", 6_000), buffer);

    engine.close(table)?;
    Ok(())
}

#[test]
fn row_length_bounds_are_enforced() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();

    let table = engine.build(&dir.path().join("t"), &options(), &key())?;

    // below the minimum
    assert!(matches!(
        engine.insert(table, &vec![b'x'; 8]),
        Err(Error::RowSize)
    ));

    // above the maximum
    assert!(matches!(
        engine.insert(table, &var_row("K1______", 9_000)),
        Err(Error::RowSize)
    ));

    engine.close(table)?;
    Ok(())
}
