//! SQLite-backed assembler.
//!
//! Binds the assembly pipeline to a transactional SQLite destination:
//! bulk-load pragmas on open, a per-table prepared insert completed lazily
//! from `PRAGMA table_info` introspection, NULL-to-rowid synthesis for the
//! rowid alias column, IMMEDIATE milestone transactions, and
//! `sqlite_sequence` reconstruction for autoincrement tables.

use std::path::{Path, PathBuf};

use rusqlite::types::{Null, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection};
use tracing::{debug, info};

use salvage_error::{tag, RepairError, RepairErrorKind, Result};
use salvage_types::{Cell, CellValue};

use crate::{Assembler, AssemblyStats};

/// Marker keeping `sqlite_sequence` writable regardless of the order tables
/// are restored in: the engine only creates the catalog table once some
/// autoincrement table exists. Created at `begin_assembly`, dropped at
/// `end_assembly`.
const SEQUENCE_MARKER_CREATE: &str =
    "CREATE TABLE IF NOT EXISTS wcdb_dummy_sqlite_sequence(i INTEGER PRIMARY KEY AUTOINCREMENT)";
const SEQUENCE_MARKER_DROP: &str = "DROP TABLE IF EXISTS wcdb_dummy_sqlite_sequence";

const SEQUENCE_UPDATE: &str = "UPDATE sqlite_sequence SET seq = ?1 WHERE name = ?2";
const SEQUENCE_INSERT: &str = "INSERT INTO sqlite_sequence(name, seq) VALUES(?1, ?2)";

/// Bulk-load pragmas applied on open. Durability is managed at milestone
/// granularity and the destination is reconstructable from its source, so
/// the journal stays off; the large memory-map window covers the write
/// burst.
const BULK_LOAD_PRAGMAS: &str = "PRAGMA journal_mode=OFF;\nPRAGMA mmap_size=2147418112;";

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`SqliteAssembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    /// No destination open.
    Closed,
    /// Destination open; inserts run in autocommit until the first
    /// milestone opens a transaction.
    Assembling,
    /// A milestone transaction is open.
    InTransaction,
}

// ---------------------------------------------------------------------------
// Table binding
// ---------------------------------------------------------------------------

/// Insert plumbing for the currently open table. The name is recorded at
/// `declare_table`; the rest is completed on the first cell, once the DDL
/// has been applied and the destination can be introspected.
#[derive(Debug)]
struct TableBinding {
    name: String,
    insert: Option<PreparedInsert>,
}

#[derive(Debug)]
struct PreparedInsert {
    sql: String,
    column_count: usize,
    /// Zero-based index of the unique single-column INTEGER PRIMARY KEY
    /// (the rowid alias), when the table has exactly one. A recovered NULL
    /// at this index is re-synthesized from the cell's row id.
    primary: Option<usize>,
}

// ---------------------------------------------------------------------------
// SqliteAssembler
// ---------------------------------------------------------------------------

/// The shipped SQL-backed assembler.
///
/// Single-owner for the whole `begin_assembly .. end_assembly` span; the
/// destination file is exclusively owned between those calls. Dropping the
/// assembler without `end_assembly` abandons the open batch, which is the
/// crash-equivalent a resuming driver replays over in duplicated mode.
pub struct SqliteAssembler {
    path: PathBuf,
    conn: Option<Connection>,
    state: AssemblerState,
    table: Option<TableBinding>,
    duplicated: bool,
    poisoned: bool,
    latched: Option<RepairError>,
    stats: AssemblyStats,
}

impl Default for SqliteAssembler {
    fn default() -> Self {
        Self::new(PathBuf::new())
    }
}

impl SqliteAssembler {
    /// Create an assembler targeting `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: None,
            state: AssemblerState::Closed,
            table: None,
            duplicated: false,
            poisoned: false,
            latched: None,
            stats: AssemblyStats::default(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> AssemblerState {
        self.state
    }

    /// Progress counters for this assembly pass.
    #[must_use]
    pub const fn stats(&self) -> AssemblyStats {
        self.stats
    }

    /// Take the latched error, clearing the slot. Drivers interested in
    /// every failure drain it between calls; the slot is otherwise
    /// overwritten by the next failing operation.
    pub fn take_error(&mut self) -> Option<RepairError> {
        self.latched.take()
    }

    fn latch(&mut self, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(error) => {
                self.latched = Some(error);
                false
            }
        }
    }

    fn connection(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| misuse("destination is not open"))
    }

    fn try_begin(&mut self) -> Result<()> {
        if self.state != AssemblerState::Closed {
            return Err(misuse("begin_assembly while already assembling"));
        }
        let conn =
            Connection::open(&self.path).map_err(|err| open_failure(&self.path, &err))?;
        // An early failure drops `conn`, closing the half-opened destination.
        conn.execute_batch(BULK_LOAD_PRAGMAS)
            .map_err(|err| open_failure(&self.path, &err))?;
        conn.execute_batch(SEQUENCE_MARKER_CREATE)
            .map_err(|err| open_failure(&self.path, &err))?;
        self.conn = Some(conn);
        self.state = AssemblerState::Assembling;
        self.poisoned = false;
        self.latched = None;
        self.stats = AssemblyStats::default();
        info!(path = %self.path.display(), duplicated = self.duplicated, "assembly started");
        Ok(())
    }

    fn try_milestone(&mut self) -> Result<()> {
        if self.state == AssemblerState::Closed {
            return Err(misuse("milestone on a closed assembler"));
        }
        if self.state == AssemblerState::InTransaction {
            if let Err(err) = self.connection()?.execute_batch("COMMIT") {
                // The open batch is neither durable nor retryable; the
                // assembler must be abandoned via end_assembly.
                self.poisoned = true;
                self.state = AssemblerState::Assembling;
                return Err(transaction_failure(&self.path, "commit", &err));
            }
            self.state = AssemblerState::Assembling;
        }
        if let Err(err) = self.connection()?.execute_batch("BEGIN IMMEDIATE") {
            self.poisoned = true;
            return Err(transaction_failure(&self.path, "begin immediate", &err));
        }
        self.state = AssemblerState::InTransaction;
        self.stats.milestones += 1;
        debug!(path = %self.path.display(), cells = self.stats.cells, "milestone reached");
        Ok(())
    }

    fn try_declare(&mut self, name: &str, ddl: &str) -> Result<()> {
        if self.state == AssemblerState::Closed {
            return Err(misuse("declare_table on a closed assembler"));
        }
        if name.is_empty() {
            return Err(misuse("declare_table with an empty table name"));
        }
        self.table = None;
        let conn = self.connection()?;
        // Drops every cached handle, finalizing the previous table's insert.
        conn.flush_prepared_statement_cache();
        conn.execute_batch(ddl).map_err(|err| {
            step_failure(&self.path, &err)
                .with_tag(tag::SQL, ddl)
                .with_tag(tag::TABLE, name)
        })?;
        self.table = Some(TableBinding {
            name: name.to_owned(),
            insert: None,
        });
        self.stats.tables += 1;
        debug!(table = name, "table declared");
        Ok(())
    }

    fn try_insert(&mut self, cell: &Cell<'_>) -> Result<()> {
        if self.state == AssemblerState::Closed {
            return Err(misuse("insert_cell outside of assembly"));
        }
        if self.poisoned {
            return Err(RepairError::error(RepairErrorKind::TransactionFailure {
                detail: "assembler poisoned by a failed milestone".to_owned(),
            })
            .with_tag(tag::PATH, self.path.display().to_string()));
        }
        let table_name = match &self.table {
            Some(binding) => binding.name.clone(),
            None => return Err(misuse("insert_cell before declare_table")),
        };
        if self.table.as_ref().is_some_and(|b| b.insert.is_none()) {
            let prepared = self.build_insert(&table_name)?;
            if let Some(binding) = self.table.as_mut() {
                binding.insert = Some(prepared);
            }
        }
        let Some(prepared) = self.table.as_ref().and_then(|b| b.insert.as_ref()) else {
            return Err(misuse("insert binding unavailable"));
        };
        if cell.count() != prepared.column_count {
            return Err(schema_mismatch(
                &self.path,
                &table_name,
                format!(
                    "cell carries {} values but the table has {} columns",
                    cell.count(),
                    prepared.column_count
                ),
            ));
        }
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| misuse("destination is not open"))?;
        {
            let mut stmt = conn
                .prepare_cached(&prepared.sql)
                .map_err(|err| prepare_failure(&self.path, &prepared.sql, &err))?;
            stmt.raw_bind_parameter(1, cell.row_id())
                .map_err(|err| step_failure(&self.path, &err))?;
            for (index, value) in cell.values().enumerate() {
                let param = index + 2;
                let bound = match *value {
                    CellValue::Integer(v) => stmt.raw_bind_parameter(param, v),
                    CellValue::Real(v) => stmt.raw_bind_parameter(param, v),
                    // The engine copies text and blob payloads out of the
                    // page buffer at bind time; the cell only has to outlive
                    // this call.
                    CellValue::Text(bytes) => {
                        stmt.raw_bind_parameter(param, ToSqlOutput::Borrowed(ValueRef::Text(bytes)))
                    }
                    CellValue::Blob(bytes) => {
                        stmt.raw_bind_parameter(param, ToSqlOutput::Borrowed(ValueRef::Blob(bytes)))
                    }
                    CellValue::Null => {
                        // The rowid alias shares storage with the row id, so
                        // a recovered NULL there means the value rode on the
                        // rowid and is re-synthesized from it.
                        if prepared.primary == Some(index) {
                            stmt.raw_bind_parameter(param, cell.row_id())
                        } else {
                            stmt.raw_bind_parameter(param, Null)
                        }
                    }
                };
                bound.map_err(|err| step_failure(&self.path, &err))?;
            }
            stmt.raw_execute().map_err(|err| {
                step_failure(&self.path, &err).with_tag(tag::TABLE, table_name.as_str())
            })?;
        }
        self.stats.cells += 1;
        Ok(())
    }

    /// Introspect the freshly created table and build its parameterized
    /// insert. Column names are spliced in verbatim as introspection
    /// returned them; the reconstructed DDL is trusted to be well-formed.
    fn build_insert(&self, table: &str) -> Result<PreparedInsert> {
        let conn = self.connection()?;
        let pragma = format!("PRAGMA table_info({table})");
        let mut stmt = conn
            .prepare(&pragma)
            .map_err(|err| prepare_failure(&self.path, &pragma, &err))?;
        let mut rows = stmt
            .query([])
            .map_err(|err| step_failure(&self.path, &err))?;
        let mut columns: Vec<String> = Vec::new();
        let mut primary = None;
        let mut max_pk = 0_i64;
        while let Some(row) = rows
            .next()
            .map_err(|err| step_failure(&self.path, &err))?
        {
            let name: String = row.get(1).map_err(|err| step_failure(&self.path, &err))?;
            // Column 5 is the 1-based ordinal of the column within the
            // primary key, 0 for non-key columns. A maximum of exactly 1
            // means a lone single-column primary key, the rowid alias case.
            let pk: i64 = row.get(5).map_err(|err| step_failure(&self.path, &err))?;
            max_pk = max_pk.max(pk);
            if pk == 1 {
                primary = Some(columns.len());
            }
            columns.push(name);
        }
        if columns.is_empty() {
            return Err(schema_mismatch(
                &self.path,
                table,
                "table_info returned no columns".to_owned(),
            ));
        }
        let primary = if max_pk == 1 { primary } else { None };

        let mut head = String::from(if self.duplicated {
            "INSERT OR IGNORE INTO "
        } else {
            "INSERT INTO "
        });
        head.push_str(table);
        head.push_str("(rowid");
        let mut tail = String::from(") VALUES(?");
        for column in &columns {
            head.push_str(", ");
            head.push_str(column);
            tail.push_str(", ?");
        }
        tail.push(')');

        Ok(PreparedInsert {
            sql: head + &tail,
            column_count: columns.len(),
            primary,
        })
    }

    fn try_restore(&mut self, table: &str, seq: i64) -> Result<()> {
        if self.state == AssemblerState::Closed {
            return Err(misuse("restore_sequence on a closed assembler"));
        }
        if seq <= 0 {
            return Ok(());
        }
        let conn = self.connection()?;
        let changes = conn
            .execute(SEQUENCE_UPDATE, params![seq, table])
            .map_err(|err| sequence_failure(&self.path, table, &err))?;
        debug_assert!(changes <= 1);
        if changes == 0 {
            conn.execute(SEQUENCE_INSERT, params![table, seq])
                .map_err(|err| sequence_failure(&self.path, table, &err))?;
        }
        self.stats.sequences += 1;
        debug!(table, seq, "sequence restored");
        Ok(())
    }

    fn try_execute(&mut self, sql: &str) -> Result<()> {
        if self.state == AssemblerState::Closed {
            return Err(misuse("execute_sql on a closed assembler"));
        }
        let conn = self.connection()?;
        // Any engine error is a real failure here; no generic code is
        // treated as an ignorable no-op.
        conn.execute_batch(sql)
            .map_err(|err| step_failure(&self.path, &err).with_tag(tag::SQL, sql))?;
        Ok(())
    }

    fn finish(&mut self) -> bool {
        if self.state == AssemblerState::Closed {
            return self.latch(Err(misuse("end_assembly on a closed assembler")));
        }
        let mut ok = true;
        self.table = None;

        if let Some(conn) = self.conn.as_ref() {
            conn.flush_prepared_statement_cache();
            if let Err(err) = conn.execute_batch(SEQUENCE_MARKER_DROP) {
                self.latched =
                    Some(step_failure(&self.path, &err).with_tag(tag::SQL, SEQUENCE_MARKER_DROP));
                ok = false;
            }
        }

        if self.state == AssemblerState::InTransaction {
            // Rolling back keeps everything up to the last milestone and
            // discards the open batch. The marker drop above rolls back with
            // it, which is fine: this path reports failure.
            let closing = if self.latched.is_some() {
                "ROLLBACK"
            } else {
                "COMMIT"
            };
            if let Some(conn) = self.conn.as_ref() {
                if let Err(err) = conn.execute_batch(closing) {
                    self.latched = Some(transaction_failure(&self.path, closing, &err));
                    ok = false;
                }
            }
        }

        if let Some(conn) = self.conn.take() {
            if let Err((zombie, err)) = conn.close() {
                drop(zombie);
                self.latched = Some(open_failure(&self.path, &err));
                ok = false;
            }
        }

        self.state = AssemblerState::Closed;
        info!(
            path = %self.path.display(),
            tables = self.stats.tables,
            cells = self.stats.cells,
            milestones = self.stats.milestones,
            sequences = self.stats.sequences,
            "assembly finished"
        );
        ok && self.latched.is_none()
    }
}

impl Assembler for SqliteAssembler {
    fn set_path(&mut self, path: &Path) {
        self.path = path.to_path_buf();
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn begin_assembly(&mut self) -> bool {
        let result = self.try_begin();
        self.latch(result)
    }

    fn end_assembly(&mut self) -> bool {
        self.finish()
    }

    fn milestone(&mut self) -> bool {
        let result = self.try_milestone();
        self.latch(result)
    }

    fn declare_table(&mut self, name: &str, ddl: &str) -> bool {
        let result = self.try_declare(name, ddl);
        self.latch(result)
    }

    fn insert_cell(&mut self, cell: &Cell<'_>) -> bool {
        let result = self.try_insert(cell);
        self.latch(result)
    }

    fn restore_sequence(&mut self, table: &str, seq: i64) -> bool {
        let result = self.try_restore(table, seq);
        self.latch(result)
    }

    fn set_duplicated(&mut self, duplicated: bool) {
        if self.duplicated != duplicated {
            self.duplicated = duplicated;
            // The insert statement bakes the conflict clause in; rebuild it
            // on the next cell.
            if let Some(binding) = self.table.as_mut() {
                binding.insert = None;
            }
        }
    }

    fn execute_sql(&mut self, sql: &str) -> bool {
        let result = self.try_execute(sql);
        self.latch(result)
    }

    fn error(&self) -> Option<&RepairError> {
        self.latched.as_ref()
    }

    fn latch_error(&mut self, error: RepairError) {
        self.latched = Some(error);
    }
}

// ---------------------------------------------------------------------------
// Error constructors
// ---------------------------------------------------------------------------

fn misuse(detail: &str) -> RepairError {
    RepairError::error(RepairErrorKind::Misuse {
        detail: detail.to_owned(),
    })
}

fn open_failure(path: &Path, err: &rusqlite::Error) -> RepairError {
    RepairError::error(RepairErrorKind::OpenFailure {
        path: path.to_path_buf(),
    })
    .with_tag(tag::PATH, path.display().to_string())
    .with_tag("engine", err.to_string())
}

fn prepare_failure(path: &Path, sql: &str, err: &rusqlite::Error) -> RepairError {
    RepairError::error(RepairErrorKind::PrepareFailure {
        detail: err.to_string(),
    })
    .with_tag(tag::PATH, path.display().to_string())
    .with_tag(tag::SQL, sql)
}

fn step_failure(path: &Path, err: &rusqlite::Error) -> RepairError {
    RepairError::error(RepairErrorKind::StepFailure {
        detail: err.to_string(),
    })
    .with_tag(tag::PATH, path.display().to_string())
}

fn transaction_failure(path: &Path, op: &str, err: &rusqlite::Error) -> RepairError {
    RepairError::error(RepairErrorKind::TransactionFailure {
        detail: format!("{op}: {err}"),
    })
    .with_tag(tag::PATH, path.display().to_string())
}

fn schema_mismatch(path: &Path, table: &str, detail: String) -> RepairError {
    RepairError::error(RepairErrorKind::SchemaMismatch {
        table: table.to_owned(),
        detail,
    })
    .with_tag(tag::PATH, path.display().to_string())
    .with_tag(tag::TABLE, table)
}

fn sequence_failure(path: &Path, table: &str, err: &rusqlite::Error) -> RepairError {
    RepairError::warning(RepairErrorKind::SequenceRestoreFailure {
        table: table.to_owned(),
        detail: err.to_string(),
    })
    .with_tag(tag::PATH, path.display().to_string())
    .with_tag(tag::TABLE, table)
}
