pub mod agent;
pub mod content;
pub mod context;
pub mod decision;
pub mod directive;
pub mod error;
pub mod event;
pub mod proposal;
pub mod task;

pub use agent::*;
pub use content::*;
pub use context::*;
pub use decision::*;
pub use directive::*;
pub use error::*;
pub use event::*;
pub use proposal::*;
pub use task::*;

/// Mint a fresh opaque identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
