pub mod bootstrap;
pub mod change;
pub mod chunking;
pub mod embedder;
pub mod error;
pub mod fs;
pub mod indexer;
pub mod priority;
pub mod watcher;

pub use bootstrap::*;
pub use change::*;
pub use chunking::*;
pub use embedder::*;
pub use error::*;
pub use indexer::*;
pub use priority::*;
pub use watcher::*;
