//! End-to-end assembly scenarios against a real destination file.
//!
//! Every test drives a [`SqliteAssembler`] the way a repair driver would and
//! then verifies the destination through an independent connection.

use rusqlite::Connection;
use tempfile::TempDir;

use salvage_assembler::{Assembler, AssemblerState, SqliteAssembler};
use salvage_error::{RepairError, RepairErrorKind};
use salvage_types::{Cell, CellValue};

fn int_cell(row_id: i64, v: i64) -> Cell<'static> {
    Cell::new(row_id, vec![CellValue::Integer(v)])
}

fn row_count(path: &std::path::Path, table: &str) -> i64 {
    let conn = Connection::open(path).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
        .unwrap()
}

#[test]
fn plain_table_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("plain.db");

    let mut asm = SqliteAssembler::new(&path);
    assert!(asm.begin_assembly(), "{:?}", asm.error());
    assert!(asm.declare_table("t", "CREATE TABLE t(a INTEGER, b TEXT)"));
    assert!(asm.insert_cell(&Cell::new(
        1,
        vec![CellValue::Integer(10), CellValue::Text(b"x")]
    )));
    assert!(asm.insert_cell(&Cell::new(
        2,
        vec![CellValue::Null, CellValue::Text(b"y")]
    )));
    assert!(asm.milestone());
    assert!(asm.end_assembly());

    let conn = Connection::open(&path).unwrap();
    let rows: Vec<(i64, Option<i64>, String)> = conn
        .prepare("SELECT rowid, a, b FROM t ORDER BY rowid")
        .unwrap()
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        rows,
        vec![
            (1, Some(10), "x".to_owned()),
            (2, None, "y".to_owned()),
        ]
    );
}

#[test]
fn rowid_alias_null_is_synthesized_from_the_row_id() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("alias.db");

    let mut asm = SqliteAssembler::new(&path);
    assert!(asm.begin_assembly());
    assert!(asm.declare_table("t", "CREATE TABLE t(id INTEGER PRIMARY KEY, v REAL)"));
    assert!(asm.insert_cell(&Cell::new(42, vec![CellValue::Null, CellValue::Real(3.5)])));
    assert!(asm.end_assembly());

    let conn = Connection::open(&path).unwrap();
    let (id, v): (i64, f64) = conn
        .query_row("SELECT id, v FROM t", [], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap();
    assert_eq!(id, 42);
    assert!((v - 3.5).abs() < f64::EPSILON);
}

#[test]
fn composite_key_gets_no_synthesis() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("composite.db");

    let mut asm = SqliteAssembler::new(&path);
    assert!(asm.begin_assembly());
    assert!(asm.declare_table(
        "t",
        "CREATE TABLE t(a INT, b INT, v TEXT, PRIMARY KEY(a, b))"
    ));
    assert!(asm.insert_cell(&Cell::new(
        7,
        vec![CellValue::Null, CellValue::Null, CellValue::Text(b"z")]
    )));
    assert!(asm.end_assembly());

    let conn = Connection::open(&path).unwrap();
    let (rowid, a, b, v): (i64, Option<i64>, Option<i64>, String) = conn
        .query_row("SELECT rowid, a, b, v FROM t", [], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .unwrap();
    assert_eq!(rowid, 7);
    assert_eq!(a, None);
    assert_eq!(b, None);
    assert_eq!(v, "z");
}

#[test]
fn milestone_bounds_durability_across_a_crash() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("durable.db");

    let mut asm = SqliteAssembler::new(&path);
    assert!(asm.begin_assembly());
    assert!(asm.declare_table("t", "CREATE TABLE t(v INTEGER)"));
    for i in 1..=1000 {
        assert!(asm.insert_cell(&int_cell(i, i)), "{:?}", asm.error());
    }
    assert!(asm.milestone());
    for i in 1001..=1500 {
        assert!(asm.insert_cell(&int_cell(i, i)));
    }
    // Crash before the next milestone: the destination is never finalized
    // and the open batch dies with the connection.
    drop(asm);

    assert_eq!(row_count(&path, "t"), 1000);
}

#[test]
fn duplicated_resume_replays_the_overlap_without_errors() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("resume.db");

    // First pass commits a milestone after row 50, then dies with rows
    // 51..=100 still in the open batch.
    let mut asm = SqliteAssembler::new(&path);
    assert!(asm.begin_assembly());
    assert!(asm.declare_table("t", "CREATE TABLE t(v INTEGER)"));
    assert!(asm.milestone());
    for i in 1..=50 {
        assert!(asm.insert_cell(&int_cell(i, i * 10)));
    }
    assert!(asm.milestone());
    for i in 51..=100 {
        assert!(asm.insert_cell(&int_cell(i, i * 10)));
    }
    drop(asm);
    assert_eq!(row_count(&path, "t"), 50);

    // Second pass replays everything in duplicated mode. The overlap is
    // ignored rather than overwritten; the lost tail is filled in.
    let mut asm = SqliteAssembler::new(&path);
    asm.set_duplicated(true);
    assert!(asm.begin_assembly());
    assert!(asm.declare_table("t", "CREATE TABLE IF NOT EXISTS t(v INTEGER)"));
    assert!(asm.milestone());
    for i in 1..=200 {
        assert!(asm.insert_cell(&int_cell(i, i * 100)), "row {i}: {:?}", asm.error());
    }
    assert!(asm.milestone());
    assert!(asm.end_assembly());

    let conn = Connection::open(&path).unwrap();
    assert_eq!(row_count(&path, "t"), 200);
    // Rows 1..=50 keep the first pass's payloads.
    let v1: i64 = conn
        .query_row("SELECT v FROM t WHERE rowid = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(v1, 10);
    let v50: i64 = conn
        .query_row("SELECT v FROM t WHERE rowid = 50", [], |r| r.get(0))
        .unwrap();
    assert_eq!(v50, 500);
    // Rows past the committed milestone come from the replay.
    let v51: i64 = conn
        .query_row("SELECT v FROM t WHERE rowid = 51", [], |r| r.get(0))
        .unwrap();
    assert_eq!(v51, 5100);
}

#[test]
fn sequence_restoration_sets_the_autoincrement_floor() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sequence.db");

    let mut asm = SqliteAssembler::new(&path);
    assert!(asm.begin_assembly());
    assert!(asm.declare_table(
        "t",
        "CREATE TABLE t(id INTEGER PRIMARY KEY AUTOINCREMENT, v INT)"
    ));
    for i in 1..=3 {
        assert!(asm.insert_cell(&Cell::new(
            i,
            vec![CellValue::Null, CellValue::Integer(i * 2)]
        )));
    }
    // Update path: the inserts above already created the sequence row.
    assert!(asm.restore_sequence("t", 1000));
    // Non-positive sequences are a no-op.
    assert!(asm.restore_sequence("t", 0));
    assert!(asm.restore_sequence("t", -5));
    assert!(asm.end_assembly());

    let conn = Connection::open(&path).unwrap();
    let seq: i64 = conn
        .query_row("SELECT seq FROM sqlite_sequence WHERE name = 't'", [], |r| {
            r.get(0)
        })
        .unwrap();
    assert_eq!(seq, 1000);

    // The next external insert continues past the restored floor.
    conn.execute("INSERT INTO t(v) VALUES(99)", []).unwrap();
    let id: i64 = conn
        .query_row("SELECT id FROM t WHERE v = 99", [], |r| r.get(0))
        .unwrap();
    assert_eq!(id, 1001);
}

#[test]
fn sequence_restoration_inserts_when_no_row_exists() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("seqinsert.db");

    let mut asm = SqliteAssembler::new(&path);
    assert!(asm.begin_assembly());
    // A plain table never touches sqlite_sequence on its own; the marker
    // table created at begin_assembly is what makes the insert possible.
    assert!(asm.declare_table("t", "CREATE TABLE t(v INTEGER)"));
    assert!(asm.restore_sequence("t", 77), "{:?}", asm.error());
    assert!(asm.end_assembly());

    let conn = Connection::open(&path).unwrap();
    let seq: i64 = conn
        .query_row("SELECT seq FROM sqlite_sequence WHERE name = 't'", [], |r| {
            r.get(0)
        })
        .unwrap();
    assert_eq!(seq, 77);
}

#[test]
fn sequence_marker_exists_only_while_assembling() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("marker.db");

    let mut asm = SqliteAssembler::new(&path);
    assert!(asm.begin_assembly());

    let probe = Connection::open(&path).unwrap();
    let mid: i64 = probe
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = 'wcdb_dummy_sqlite_sequence'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(mid, 1);
    drop(probe);

    assert!(asm.end_assembly());

    let probe = Connection::open(&path).unwrap();
    let after: i64 = probe
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = 'wcdb_dummy_sqlite_sequence'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(after, 0);
}

#[test]
fn duplicated_mode_keeps_the_existing_row() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dup.db");

    let mut asm = SqliteAssembler::new(&path);
    asm.set_duplicated(true);
    assert!(asm.begin_assembly());
    assert!(asm.declare_table("t", "CREATE TABLE t(v INTEGER)"));
    assert!(asm.insert_cell(&int_cell(1, 111)));
    assert!(asm.insert_cell(&int_cell(1, 222)), "{:?}", asm.error());
    assert!(asm.end_assembly());

    let conn = Connection::open(&path).unwrap();
    let v: i64 = conn
        .query_row("SELECT v FROM t WHERE rowid = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(v, 111);
    assert_eq!(row_count(&path, "t"), 1);
}

#[test]
fn strict_mode_latches_the_duplicate_and_recovers_per_table() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("strict.db");

    let mut asm = SqliteAssembler::new(&path);
    assert!(asm.begin_assembly());
    assert!(asm.declare_table("t", "CREATE TABLE t(v INTEGER)"));
    assert!(asm.insert_cell(&int_cell(1, 111)));
    assert!(!asm.insert_cell(&int_cell(1, 222)));
    assert!(matches!(
        asm.error().unwrap().kind(),
        RepairErrorKind::StepFailure { .. }
    ));

    // A successful declare_table makes the assembler usable again.
    assert!(asm.declare_table("u", "CREATE TABLE u(v INTEGER)"));
    assert!(asm.insert_cell(&int_cell(1, 1)));

    // The step failure is still latched, so ending rolls back nothing here
    // (no transaction was ever opened) but reports the failure.
    assert!(!asm.end_assembly());
    assert_eq!(row_count(&path, "u"), 1);
}

#[test]
fn latched_error_forces_rollback_at_end() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cancel.db");

    let mut asm = SqliteAssembler::new(&path);
    assert!(asm.begin_assembly());
    assert!(asm.declare_table("t", "CREATE TABLE t(v INTEGER)"));
    assert!(asm.milestone());
    for i in 1..=10 {
        assert!(asm.insert_cell(&int_cell(i, i)));
    }
    assert!(asm.milestone());
    for i in 11..=20 {
        assert!(asm.insert_cell(&int_cell(i, i)));
    }
    // Cancellation: install a synthetic error so end_assembly rolls back the
    // open batch instead of committing it.
    asm.latch_error(RepairError::error(RepairErrorKind::Misuse {
        detail: "cancelled by driver".to_owned(),
    }));
    assert!(!asm.end_assembly());
    assert_eq!(asm.state(), AssemblerState::Closed);

    assert_eq!(row_count(&path, "t"), 10);
}

#[test]
fn multiple_tables_in_one_pass() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("multi.db");

    let mut asm = SqliteAssembler::new(&path);
    assert!(asm.begin_assembly());
    assert!(asm.declare_table("a", "CREATE TABLE a(x INTEGER)"));
    for i in 1..=4 {
        assert!(asm.insert_cell(&int_cell(i, i)));
    }
    assert!(asm.milestone());
    assert!(asm.declare_table("b", "CREATE TABLE b(y TEXT, z BLOB)"));
    assert!(asm.insert_cell(&Cell::new(
        1,
        vec![CellValue::Text(b"payload"), CellValue::Blob(&[1, 2, 3])]
    )));
    assert!(asm.milestone());
    assert!(asm.end_assembly());
    assert_eq!(asm.stats().tables, 2);
    assert_eq!(asm.stats().cells, 5);

    assert_eq!(row_count(&path, "a"), 4);
    let conn = Connection::open(&path).unwrap();
    let (y, z): (String, Vec<u8>) = conn
        .query_row("SELECT y, z FROM b", [], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap();
    assert_eq!(y, "payload");
    assert_eq!(z, vec![1, 2, 3]);
}
