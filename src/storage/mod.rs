//! Durable storage: SQLite pool, migrations, user records, payment intents and price overrides

pub mod db;
pub mod intents;
pub mod migrations;
pub mod prices;
pub mod records;
pub mod users;

// Re-exports for convenience
pub use db::{create_memory_pool, create_pool, get_connection, DbConnection, DbPool, StoreError, StoreResult};
pub use intents::{IntentStatus, IntentStore, PaymentIntent};
pub use prices::{PriceStore, TariffPrice};
pub use records::{PaymentEvent, PaymentKind, PaymentStatus, SubscriptionPatch, UserSubscriptionRecord};
pub use users::{CommitOutcome, UserRecordStore};
