pub mod binance;
pub mod http_client_factory;
pub mod locks;
pub mod mock;
pub mod observability;
pub mod persistence;

pub use locks::{LeaseLock, PassthroughLock};
pub use observability::Metrics;
pub use persistence::SqliteDocumentStore;
