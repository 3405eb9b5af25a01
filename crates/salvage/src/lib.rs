//! Salvage: database repair assembler stack.
//!
//! Facade crate over the workspace members. A repair driver feeds a
//! reconstructed schema and a stream of recovered [`Cell`]s into an
//! [`Assembler`] (in practice the shipped [`SqliteAssembler`]), replaying
//! inserts in large atomic units of work bounded by milestones. Failures
//! latch on the assembler; process-wide diagnostics and corruption events
//! flow through the [`Notifier`].
//!
//! ```no_run
//! use salvage::{Assembler, Cell, CellValue, SqliteAssembler};
//!
//! let mut assembler = SqliteAssembler::new("/tmp/rebuilt.db");
//! assert!(assembler.begin_assembly());
//! assert!(assembler.declare_table("t", "CREATE TABLE t(a INTEGER, b TEXT)"));
//! let cell = Cell::new(1, vec![CellValue::Integer(10), CellValue::Text(b"x")]);
//! assert!(assembler.insert_cell(&cell));
//! assert!(assembler.milestone());
//! assert!(assembler.end_assembly());
//! ```

pub use salvage_assembler::{
    Assembler, AssemblerHolder, AssemblerState, AssemblyStats, SqliteAssembler,
};
pub use salvage_error::{tag, ErrorCode, RepairError, RepairErrorKind, Result, Severity};
pub use salvage_notifier::{Notifier, LOG_NOTIFICATION_NAME};
pub use salvage_types::{Cell, CellValue, ValueType};
