//! Error fabric for the repair pipeline.
//!
//! Every fallible repair operation produces a [`RepairError`]: a severity
//! level, a structured kind that maps onto SQLite's numeric result codes, and
//! a free-form keyed map of context tags (destination path, offending SQL,
//! table name, source location). Assemblers hold one latched most-recent
//! error; the notifier fabric dispatches them process-wide.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known context tag keys.
pub mod tag {
    /// Absolute destination path of the database the error refers to.
    pub const PATH: &str = "path";
    /// SQL statement that triggered the failure.
    pub const SQL: &str = "sql";
    /// Table the operation was targeting.
    pub const TABLE: &str = "table";
    /// Source file of the call site, for producer-attributed events.
    pub const FILE: &str = "file";
    /// Source line of the call site.
    pub const LINE: &str = "line";
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// How serious a repair event is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Diagnostic chatter, never surfaced to users.
    Debug,
    /// Suppressed event kept only for listeners that opt in.
    Ignore,
    /// Something went wrong but the operation can continue degraded.
    Warning,
    /// The operation failed.
    Error,
    /// The process-level invariant is broken; abandon the pipeline.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "DEBUG",
            Self::Ignore => "IGNORE",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// SQLite-compatible result codes
// ---------------------------------------------------------------------------

/// Numeric result codes matching C SQLite's `sqlite3.h` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Callback requested abort.
    Abort = 4,
    /// Database file is locked.
    Busy = 5,
    /// Disk I/O error.
    IoErr = 10,
    /// Database disk image is malformed.
    Corrupt = 11,
    /// Database or disk is full.
    Full = 13,
    /// Unable to open database file.
    CantOpen = 14,
    /// Database schema mismatch.
    Schema = 17,
    /// Constraint violation.
    Constraint = 19,
    /// Data type mismatch.
    Mismatch = 20,
    /// Library used incorrectly.
    Misuse = 21,
    /// Not a database file.
    NotADb = 26,
}

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Structured failure kinds the repair pipeline produces.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairErrorKind {
    /// Destination could not be opened or its bulk-load pragmas failed.
    /// Recoverable only by choosing a different destination.
    #[error("unable to open assemble destination: '{path}'")]
    OpenFailure { path: PathBuf },

    /// Table introspection failed, returned no columns, or a cell's column
    /// count disagrees with the destination schema. Non-retryable for that
    /// table.
    #[error("schema mismatch on table {table}: {detail}")]
    SchemaMismatch { table: String, detail: String },

    /// The storage engine rejected a statement at prepare time.
    #[error("prepare failed: {detail}")]
    PrepareFailure { detail: String },

    /// The storage engine rejected a statement at step time.
    #[error("step failed: {detail}")]
    StepFailure { detail: String },

    /// A milestone transaction could not commit or begin. The assembler is
    /// poisoned and must be ended.
    #[error("transaction failed: {detail}")]
    TransactionFailure { detail: String },

    /// `sqlite_sequence` could not be restored for a table. Non-fatal: the
    /// table stays usable, autoincrement may restart lower.
    #[error("sequence restore failed for table {table}: {detail}")]
    SequenceRestoreFailure { table: String, detail: String },

    /// The source database is corrupt. Routed to the corruption sink by the
    /// notifier rather than through an assembler's error slot.
    #[error("database disk image is malformed: '{path}'")]
    Corruption { path: PathBuf },

    /// An operation was invoked in a state that forbids it.
    #[error("misuse: {detail}")]
    Misuse { detail: String },

    /// Free-form event carrying only a message, used by the notifier's
    /// convenience producers.
    #[error("{0}")]
    Message(String),
}

impl RepairErrorKind {
    /// Map this kind to a SQLite-compatible numeric code.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::OpenFailure { .. } => ErrorCode::CantOpen,
            Self::SchemaMismatch { .. } => ErrorCode::Schema,
            Self::PrepareFailure { .. }
            | Self::StepFailure { .. }
            | Self::SequenceRestoreFailure { .. }
            | Self::Message(_) => ErrorCode::Error,
            Self::TransactionFailure { .. } => ErrorCode::Busy,
            Self::Corruption { .. } => ErrorCode::Corrupt,
            Self::Misuse { .. } => ErrorCode::Misuse,
        }
    }
}

// ---------------------------------------------------------------------------
// RepairError
// ---------------------------------------------------------------------------

/// A repair event: severity, structured kind, and keyed context tags.
///
/// Fallible pipeline operations latch the most recent `RepairError` on their
/// owner; the next failure overwrites it, so drivers interested in every
/// failure must drain the slot between calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairError {
    level: Severity,
    kind: RepairErrorKind,
    context: BTreeMap<String, String>,
}

impl RepairError {
    /// Build an event at an explicit severity.
    #[must_use]
    pub fn new(level: Severity, kind: RepairErrorKind) -> Self {
        Self {
            level,
            kind,
            context: BTreeMap::new(),
        }
    }

    /// Build an `Error`-level event.
    #[must_use]
    pub fn error(kind: RepairErrorKind) -> Self {
        Self::new(Severity::Error, kind)
    }

    /// Build a `Warning`-level event.
    #[must_use]
    pub fn warning(kind: RepairErrorKind) -> Self {
        Self::new(Severity::Warning, kind)
    }

    /// Build a `Fatal`-level event.
    #[must_use]
    pub fn fatal(kind: RepairErrorKind) -> Self {
        Self::new(Severity::Fatal, kind)
    }

    /// Attach a context tag, overwriting any previous value for the key.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// The severity level.
    #[must_use]
    pub const fn level(&self) -> Severity {
        self.level
    }

    /// The structured kind.
    #[must_use]
    pub const fn kind(&self) -> &RepairErrorKind {
        &self.kind
    }

    /// SQLite-compatible numeric code derived from the kind.
    #[must_use]
    pub const fn code(&self) -> i32 {
        self.kind.error_code() as i32
    }

    /// The rendered message.
    #[must_use]
    pub fn message(&self) -> String {
        self.kind.to_string()
    }

    /// Look up a context tag.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    /// All context tags in key order.
    #[must_use]
    pub const fn tags(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    /// The destination path this event refers to, from the `path` tag.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.tag(tag::PATH)
    }

    /// Whether this event classifies as corruption. Corruption events with a
    /// non-empty `path` tag are routed to the corruption sink.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self.kind, RepairErrorKind::Corruption { .. })
    }
}

impl fmt::Display for RepairError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] code {}: {}", self.level, self.code(), self.kind)?;
        for (key, value) in &self.context {
            write!(f, ", {key}: {value}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RepairError {}

/// Result type alias using `RepairError`.
pub type Result<T> = std::result::Result<T, RepairError>;
