// =============================================================================
// Order lifecycle — creation, cancellation, reconciliation, deferred cancels
// =============================================================================

pub mod cancel_queue;
pub mod manager;

pub use cancel_queue::CancelQueueWorker;
pub use manager::{
    BulkCancelReport, CancelOutcome, OrderManager, OrderSpec, PlacedOrder, ReconcileReport,
};
