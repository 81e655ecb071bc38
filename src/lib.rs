pub mod codec;
pub mod config;
pub mod data;
pub mod registry;
pub mod remote;
pub mod sync;
pub mod util;

pub use config::Config;
pub use data::{Database, Message, MessageId, MessageStore, RepositoryTarget, TargetKey};
pub use registry::{Registry, RegistryError};
pub use remote::{RemoteError, RemoteFactory, RemoteRepository, RetryPolicy};
pub use sync::{SyncEngine, SyncReport, TargetError, TargetStatus};
