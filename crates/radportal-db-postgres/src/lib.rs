//! PostgreSQL storage backend for the RadPortal SMS notification engine.
//!
//! Implements the engine's storage traits on top of sqlx:
//!
//! - [`PostgresNotificationStorage`]: `NotificationStore` (requests and row leases)
//! - [`PostgresConsentStorage`]: `ConsentStore` (preferences, opt-out audit)
//! - [`PostgresDeliveryLog`]: `DeliveryLog` (append-only audit trail)
//! - [`PostgresPortalDirectory`]: `PortalDirectory` (read access to portal records)
//!
//! Engine tables are created on first use.

mod config;
mod consent_storage;
mod convert;
mod delivery_log;
mod directory;
mod error;
mod notification_storage;
mod pool;

pub use config::PostgresConfig;
pub use consent_storage::PostgresConsentStorage;
pub use delivery_log::PostgresDeliveryLog;
pub use directory::PostgresPortalDirectory;
pub use error::{PostgresError, Result, is_undefined_table};
pub use notification_storage::PostgresNotificationStorage;
pub use pool::{create_pool, mask_password, ping};

pub use sqlx_postgres::PgPool;
