pub mod config;
pub mod event_bus;
pub mod logging;
pub mod registry;
pub mod state_machine;

pub use config::*;
pub use event_bus::*;
pub use logging::*;
pub use registry::*;
pub use state_machine::*;
