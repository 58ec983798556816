//! Observability infrastructure for squall.
//!
//! Counters are recorded through the `metrics` facade; the host application
//! decides which recorder (if any) to install.

pub mod events;

/// Emit an internal event as a metric.
///
/// This macro calls the `InternalEvent::emit()` method on the given event,
/// which records the corresponding counter metric.
///
/// # Example
///
/// ```ignore
/// use squall::metrics::events::RecordFetched;
///
/// emit!(RecordFetched { topic: "orders".to_string() });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
