pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod logging_setup;
pub mod macros;
pub mod store;

pub use config::RunnerConfig;
pub use error::{AppError, Result};
pub use events::{BroadcastEventBus, DomainEvent, EventBus, InboundEvent};
pub use store::{SqliteStore, Store};
