//! Pool-owning persistence services.
//!
//! Each store wraps the shared `PgPool` and exposes the queries one
//! subsystem needs. All shared state between workers lives here (or in
//! explicitly TTL'd snapshots); nothing is hidden in process globals.

pub mod cursors;
pub mod dlq;
pub mod events;
pub mod idempotency;
pub mod incidents;
pub mod pattern_cache;
pub mod quarantine;
pub mod raw_emails;

pub use cursors::CursorStore;
pub use dlq::DeadLetterStore;
pub use events::AlertEventStore;
pub use idempotency::{Begin, IdempotencyStore};
pub use incidents::IncidentStore;
pub use pattern_cache::PatternCacheStore;
pub use quarantine::QuarantineStore;
pub use raw_emails::RawEmailStore;
