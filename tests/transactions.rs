use isam_tree::{
    BuildOptions, Error, Isam, KeyDescriptor, KeyPart, PartType, ReadFlags, ReadMode,
};
use test_log::test;

fn row32(key: &str, tail: &str) -> Vec<u8> {
    let mut row = vec![b' '; 32];
    row[..key.len()].copy_from_slice(key.as_bytes());
    row[8..8 + tail.len()].copy_from_slice(tail.as_bytes());
    row
}

fn unique_key8() -> KeyDescriptor {
    KeyDescriptor::unique(KeyPart::ascending(0, 8, PartType::Char))
}

#[test]
fn begin_requires_a_log() {
    let mut engine = Isam::new();
    assert!(matches!(engine.begin(), Err(Error::NoLogging)));
}

#[test]
fn commit_requires_a_begin() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();
    engine.log_open(&dir.path().join("isam.log"))?;

    assert!(matches!(engine.commit(), Err(Error::NoBegin)));
    assert!(matches!(engine.rollback(), Err(Error::NoBegin)));

    Ok(())
}

#[test]
fn rollback_of_an_update_restores_the_old_bytes() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();
    engine.log_open(&dir.path().join("isam.log"))?;

    let table = engine.build(
        &dir.path().join("t"),
        &BuildOptions::new(32),
        &unique_key8(),
    )?;

    let original = row32("AAAAAAAA", "before");
    engine.insert(table, &original)?;

    engine.begin()?;

    let mut buffer = row32("AAAAAAAA", "");
    engine.read(table, &mut buffer, ReadMode::Equal, ReadFlags::none())?;

    engine.update_current(table, &row32("AAAAAAAA", "after!"))?;
    engine.rollback()?;

    let mut buffer = row32("AAAAAAAA", "");
    engine.read(table, &mut buffer, ReadMode::Equal, ReadFlags::none())?;
    assert_eq!(original, buffer);

    engine.close(table)?;
    Ok(())
}

#[test]
fn rollback_of_an_insert_removes_every_trace() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();
    engine.log_open(&dir.path().join("isam.log"))?;

    let table = engine.build(
        &dir.path().join("t"),
        &BuildOptions::new(32),
        &unique_key8(),
    )?;

    engine.insert(table, &row32("AAAAAAAA", ""))?;
    let rows_before = engine.table_info(table)?.row_count;

    engine.begin()?;
    engine.insert(table, &row32("BBBBBBBB", ""))?;
    engine.rollback()?;

    let mut buffer = row32("BBBBBBBB", "");
    assert!(matches!(
        engine.read(table, &mut buffer, ReadMode::Equal, ReadFlags::none()),
        Err(Error::NoRecord)
    ));

    assert_eq!(rows_before, engine.table_info(table)?.row_count);

    engine.close(table)?;
    Ok(())
}

#[test]
fn rollback_of_a_delete_revives_the_row() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();
    engine.log_open(&dir.path().join("isam.log"))?;

    let table = engine.build(
        &dir.path().join("t"),
        &BuildOptions::new(32),
        &unique_key8(),
    )?;

    let row = row32("AAAAAAAA", "body");
    let row_id = engine.insert(table, &row)?;

    engine.begin()?;
    engine.delete(table, &row)?;

    // gone inside the transaction
    let mut buffer = row32("AAAAAAAA", "");
    assert!(matches!(
        engine.read(table, &mut buffer, ReadMode::Equal, ReadFlags::none()),
        Err(Error::NoRecord)
    ));

    engine.rollback()?;

    // back, same id, same bytes
    let mut buffer = row32("AAAAAAAA", "");
    let read_id = engine.read(table, &mut buffer, ReadMode::Equal, ReadFlags::none())?;
    assert_eq!(row_id, read_id);
    assert_eq!(row, buffer);

    engine.close(table)?;
    Ok(())
}

#[test]
fn committed_work_survives() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();
    engine.log_open(&dir.path().join("isam.log"))?;

    let table = engine.build(
        &dir.path().join("t"),
        &BuildOptions::new(32),
        &unique_key8(),
    )?;

    engine.begin()?;
    engine.insert(table, &row32("AAAAAAAA", ""))?;
    engine.insert(table, &row32("BBBBBBBB", ""))?;
    engine.delete(table, &row32("AAAAAAAA", ""))?;
    engine.commit()?;

    let mut buffer = vec![];
    engine.read(table, &mut buffer, ReadMode::First, ReadFlags::none())?;
    assert_eq!(row32("BBBBBBBB", ""), buffer);

    assert!(matches!(
        engine.read(table, &mut buffer, ReadMode::Next, ReadFlags::none()),
        Err(Error::EndOfFile)
    ));

    engine.close(table)?;
    Ok(())
}

#[test]
fn close_inside_a_transaction_keeps_the_table_revivable() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();
    engine.log_open(&dir.path().join("isam.log"))?;

    let base = dir.path().join("t");
    let table = engine.build(&base, &BuildOptions::new(32), &unique_key8())?;

    engine.begin()?;
    engine.insert(table, &row32("AAAAAAAA", ""))?;

    // a mid-transaction close demotes the handle instead of killing it
    engine.close(table)?;

    let mut buffer = vec![];
    assert!(matches!(
        engine.read(table, &mut buffer, ReadMode::First, ReadFlags::none()),
        Err(Error::NotOpen)
    ));

    // re-opening the same name revives the handle mid-transaction
    let revived = engine.open(&base, &isam_tree::OpenOptions::default())?;
    engine.read(revived, &mut buffer, ReadMode::First, ReadFlags::none())?;
    assert_eq!(row32("AAAAAAAA", ""), buffer);

    engine.commit()?;
    engine.close(revived)?;
    Ok(())
}

#[test]
fn double_open_of_an_active_table_is_refused() -> isam_tree::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut engine = Isam::new();

    let base = dir.path().join("t");
    let table = engine.build(&base, &BuildOptions::new(32), &unique_key8())?;

    assert!(matches!(
        engine.open(&base, &isam_tree::OpenOptions::default()),
        Err(Error::FileLocked)
    ));

    engine.close(table)?;
    Ok(())
}
