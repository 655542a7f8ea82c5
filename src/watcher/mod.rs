//! Multiplexed file watching.
//!
//! Many frontend connections share one native watch engine. Each connection
//! gets its own handles and only hears about changes under its own requests.
//!
//! # Architecture
//!
//! ```text
//! ReconnectingWatcher     ClientProxy (one per connection)
//!          \                  |
//!           +-----------------+
//!                    |
//!            WatcherServerHandle
//!                    |
//!              WatcherServer ----- WatchRegistry
//!               |        |
//!        WatchEngine   ClientDispatcher
//!   (notify or manual)       |
//!                      WatcherClient callbacks
//! ```

pub mod client;
mod collection;
pub mod dispatcher;
pub mod engine;
mod error;
mod filter;
pub mod protocol;
pub mod reconnect;
mod registry;
pub mod server;

pub use client::{ClientProxy, FileSystemWatcher, SessionKey};
pub use collection::ChangeCollection;
pub use dispatcher::{ChannelClient, ClientDispatcher, ClientNotification, WatcherClient};
pub use engine::{
    EngineEvent, EngineEvents, ManualController, ManualEngine, NotifyEngine, WatchEngine,
};
pub use error::WatchError;
pub use filter::IgnoreFilter;
pub use protocol::{
    ClientId, DidFilesChangedParams, FileChange, FileChangeType, FileSystemWatcherErrorParams,
    WatchOptions, WatcherHandle,
};
pub use reconnect::{ConnectionState, ReconnectingWatcher, ReplayReport};
pub use registry::{WatchRegistry, WatchRequest};
pub use server::{ServerEpoch, ServerStats, WatcherServer, WatcherServerBuilder, WatcherServerHandle};
