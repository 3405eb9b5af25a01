//! Process-wide dispatch of repair events.
//!
//! The [`Notifier`] is a singleton registry of named listeners plus at most
//! one corruption sink. Producers anywhere in the pipeline call
//! [`Notifier::notify`]; every registered listener receives every event, and
//! events that classify as corruption (corruption kind with a non-empty
//! `path` tag) are additionally routed to the corruption sink with the
//! affected database path.
//!
//! Delivery takes the registry's shared lock; registration takes the
//! exclusive lock. Listeners are pure sinks: registering or unregistering
//! from inside a callback deadlocks on the held shared lock. A listener that
//! panics is isolated: the panic is swallowed and the remaining listeners
//! still receive the event.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use salvage_error::{tag, RepairError, RepairErrorKind, Severity};

/// Listener name reserved for the default logging sink.
pub const LOG_NOTIFICATION_NAME: &str = "com.Tencent.WCDB.Notifier.Log";

/// A registered event listener.
pub type Callback = Arc<dyn Fn(&RepairError) + Send + Sync>;

/// The corruption sink, invoked with the affected database path.
pub type CorruptionCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Registry {
    callbacks: BTreeMap<String, Callback>,
    corruption: Option<CorruptionCallback>,
}

/// Process-wide event dispatcher.
pub struct Notifier {
    registry: RwLock<Registry>,
}

impl Notifier {
    /// The shared process-wide notifier.
    ///
    /// First access installs [`Notifier::logger`] under
    /// [`LOG_NOTIFICATION_NAME`].
    pub fn shared() -> &'static Self {
        static SHARED: OnceLock<Notifier> = OnceLock::new();
        SHARED.get_or_init(|| {
            let notifier = Self {
                registry: RwLock::new(Registry::default()),
            };
            notifier.set_notification(LOG_NOTIFICATION_NAME, Arc::new(Self::logger));
            notifier
        })
    }

    /// Dispatch an event to every registered listener.
    ///
    /// Ordering across listeners within one call is unspecified; each
    /// listener sees a single sequential stream of events. Listener panics
    /// are swallowed and do not affect other listeners or the caller.
    pub fn notify(&self, event: &RepairError) {
        let registry = self.registry.read();
        for (name, callback) in &registry.callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                debug!(listener = %name, "notification listener panicked; event dropped for it");
            }
        }
        if event.is_corruption() {
            if let Some(path) = event.path().filter(|p| !p.is_empty()) {
                if let Some(corruption) = &registry.corruption {
                    let _ = panic::catch_unwind(AssertUnwindSafe(|| corruption(path)));
                }
            }
        }
    }

    /// Register or overwrite a listener under `name`.
    pub fn set_notification(&self, name: impl Into<String>, callback: Callback) {
        self.registry.write().callbacks.insert(name.into(), callback);
    }

    /// Remove the listener registered under `name`, if any.
    pub fn remove_notification(&self, name: &str) {
        self.registry.write().callbacks.remove(name);
    }

    /// Install the corruption sink, replacing any previous one.
    pub fn set_corruption_notification(&self, callback: CorruptionCallback) {
        self.registry.write().corruption = Some(callback);
    }

    /// Default sink: Fatal and Error events go to the error log, Warning to
    /// the warning log, Debug to the debug log. Ignore-level events are
    /// suppressed.
    pub fn logger(event: &RepairError) {
        match event.level() {
            Severity::Fatal | Severity::Error => error!(event = %event, "repair event"),
            Severity::Warning => warn!(event = %event, "repair event"),
            Severity::Debug => debug!(event = %event, "repair event"),
            Severity::Ignore => {}
        }
    }

    /// Emit a fatal event attributed to a call site.
    pub fn fatal(message: impl Into<String>, file: &str, line: u32) {
        Self::emit(Severity::Fatal, message, file, line);
    }

    /// Emit an error event attributed to a call site.
    pub fn error(message: impl Into<String>, file: &str, line: u32) {
        Self::emit(Severity::Error, message, file, line);
    }

    /// Emit a warning event attributed to a call site.
    pub fn warning(message: impl Into<String>, file: &str, line: u32) {
        Self::emit(Severity::Warning, message, file, line);
    }

    fn emit(level: Severity, message: impl Into<String>, file: &str, line: u32) {
        let event = RepairError::new(level, RepairErrorKind::Message(message.into()))
            .with_tag(tag::FILE, file)
            .with_tag(tag::LINE, line.to_string());
        Self::shared().notify(&event);
    }
}
