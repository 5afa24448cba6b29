//! Node startup utilities

mod logging;
mod node;
mod shutdown;

pub use logging::{LOG_ENV, LoggingConfig, LoggingGuard, init_logging};
pub use node::Node;
pub use shutdown::wait_for_shutdown_signal;
