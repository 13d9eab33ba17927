//! Indicator fetching: upstream formats, transport, snapshots and the
//! service that layers them with the cache and resilience modules.

pub mod api_types;
pub mod client;
pub mod journal;
pub mod service;
pub mod snapshot;
pub mod types;

pub use client::{HttpTransport, Transport};
pub use journal::{ErrorJournal, JournalEntry};
pub use service::IndicatorService;
pub use snapshot::{SnapshotLocation, SnapshotReader};
pub use types::{DataOrigin, IndicatorData, Period, Reading};
