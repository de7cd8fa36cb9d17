//! Observability: structured logging setup and span macros

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

pub use logging::{broker_span, link_span, subscription_span};
