pub mod clock;
pub mod config;
pub mod consent;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod hours;
pub mod memory;
pub mod orchestrator;
pub mod phone;
pub mod processor;
pub mod retry;
pub mod service;
pub mod store;
pub mod system;
pub mod templates;
pub mod timing;
pub mod tracker;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use consent::ConsentGate;
pub use directory::{InMemoryDirectory, PortalDirectory};
pub use error::NotificationError;
pub use gateway::{HttpSmsGateway, LoggingGateway, SmsGateway};
pub use hours::{BusinessHours, ScheduleDecision};
pub use memory::{InMemoryConsentStore, InMemoryDeliveryLog, InMemoryNotificationStore};
pub use orchestrator::{AutomationOrchestrator, DomainEvent};
pub use processor::NotificationProcessor;
pub use retry::{RetryEngine, RetryReport};
pub use service::{NotificationEngine, NotificationService};
pub use store::{ConsentStore, DeliveryLog, NotificationStore};
pub use system::{Backends, NotificationSystem};
pub use templates::{Template, TemplateRenderer};
pub use tracker::{DeliveryTracker, ProviderCallback};
pub use types::*;
