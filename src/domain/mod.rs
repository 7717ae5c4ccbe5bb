// Signal and order contracts
pub mod order;
pub mod signal;

// Position model (strategy / exchange / contributions)
pub mod position;

// Runtime configuration and leverage tracking
pub mod trading_config;

// Close-event channel messages
pub mod events;

// Port interfaces
pub mod ports;

// Domain-specific error types
pub mod errors;
