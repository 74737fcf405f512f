// Engine Module
// Registry of engine descriptors, the adapters behind them, and the
// dispatcher that turns a connection URI into a live connection.

pub mod connection;
pub mod descriptor;
pub mod dispatcher;
pub mod drivers;
pub mod negotiator;
pub(crate) mod pool;
pub mod registry;
pub mod target;
pub mod traits;

pub use connection::{Connection, ConnectionState};
pub use descriptor::{AuthMode, EngineDescriptor, PathLayout, PathParam};
pub use dispatcher::Dispatcher;
pub use registry::EngineRegistry;
pub use target::ConnectTarget;
pub use traits::{EngineAdapter, SessionOptions};
