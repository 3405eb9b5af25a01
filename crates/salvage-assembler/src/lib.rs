//! Repair assembler: rebuilds a consistent database from recovered rows.
//!
//! A repair driver owns one assembler for the full span between
//! [`Assembler::begin_assembly`] and [`Assembler::end_assembly`]. For every
//! recovered table it emits a [`Assembler::declare_table`] followed by a burst
//! of [`Assembler::insert_cell`] calls, punctuated by
//! [`Assembler::milestone`] to commit a durable unit of work; after all
//! tables it restores autoincrement identity with
//! [`Assembler::restore_sequence`].
//!
//! Every operation returns a success flag and latches the most recent failure
//! on the assembler; drivers interested in every failure must drain the slot
//! between calls. The one shipped implementation is [`SqliteAssembler`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use salvage_error::RepairError;
use salvage_types::Cell;

pub mod sqlite;

pub use sqlite::{AssemblerState, SqliteAssembler};

// ---------------------------------------------------------------------------
// Assembler contract
// ---------------------------------------------------------------------------

/// The assembly pipeline a repair driver pushes reconstructed schema and
/// recovered rows into.
///
/// Implementations are variant backends over some storage engine. An
/// assembler is single-owner: concurrent calls against one instance are not
/// supported, but independent instances against different destinations may
/// run on separate threads.
pub trait Assembler {
    /// Set the destination file the rebuilt database is written to.
    fn set_path(&mut self, path: &Path);

    /// The destination file.
    fn path(&self) -> &Path;

    /// Open the destination and prepare it for bulk load.
    fn begin_assembly(&mut self) -> bool;

    /// Finalize outstanding work, commit or roll back the open milestone
    /// transaction, and close the destination.
    fn end_assembly(&mut self) -> bool;

    /// Commit the open transaction (if any) and begin a new IMMEDIATE
    /// transaction. Data preceding the most recent successful milestone
    /// survives any later crash.
    fn milestone(&mut self) -> bool;

    /// Execute the reconstructed `CREATE TABLE` DDL and make `name` the
    /// current insertion target.
    fn declare_table(&mut self, name: &str, ddl: &str) -> bool;

    /// Insert one recovered row into the current table.
    fn insert_cell(&mut self, cell: &Cell<'_>) -> bool;

    /// Ensure `sqlite_sequence` records `seq` for `table`. A no-op when
    /// `seq <= 0`.
    fn restore_sequence(&mut self, table: &str, seq: i64) -> bool;

    /// Toggle insert-or-ignore semantics, for replaying into a destination
    /// that may already contain some recovered rows.
    fn set_duplicated(&mut self, duplicated: bool);

    /// Escape hatch for catalog DDL/DML the assembler does not otherwise
    /// model.
    fn execute_sql(&mut self, sql: &str) -> bool;

    /// The latched most-recent error, if any failure has occurred.
    fn error(&self) -> Option<&RepairError>;

    /// Install a synthetic error. Forces the rollback path at
    /// `end_assembly`, which is how a driver cancels without a prior
    /// failure.
    fn latch_error(&mut self, error: RepairError);
}

// ---------------------------------------------------------------------------
// Holder
// ---------------------------------------------------------------------------

/// Owns the assembler a repair driver routes its output through.
pub struct AssemblerHolder {
    assembler: Box<dyn Assembler + Send>,
}

impl AssemblerHolder {
    /// Wrap a backend.
    #[must_use]
    pub fn new(assembler: Box<dyn Assembler + Send>) -> Self {
        Self { assembler }
    }

    /// Replace the backend.
    pub fn set_assembler(&mut self, assembler: Box<dyn Assembler + Send>) {
        self.assembler = assembler;
    }

    /// Borrow the backend.
    #[must_use]
    pub fn assembler(&self) -> &(dyn Assembler + Send) {
        self.assembler.as_ref()
    }

    /// Mutably borrow the backend.
    pub fn assembler_mut(&mut self) -> &mut (dyn Assembler + Send) {
        self.assembler.as_mut()
    }
}

// ---------------------------------------------------------------------------
// Progress counters
// ---------------------------------------------------------------------------

/// Running totals for one assembly pass, for progress reporting and crash
/// diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyStats {
    /// Tables successfully declared.
    pub tables: u64,
    /// Cells successfully inserted.
    pub cells: u64,
    /// Milestones successfully reached.
    pub milestones: u64,
    /// Sequence rows restored.
    pub sequences: u64,
}
