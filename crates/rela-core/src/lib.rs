// SPDX-License-Identifier: Apache-2.0

//! Universal connection model shared by the dispatch layer and its adapters.

pub mod capability;
pub mod error;
pub mod sensitive;
pub mod spec;
pub mod types;

pub use capability::{Capability, CapabilitySet};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use sensitive::Sensitive;
pub use spec::ConnectionSpec;
pub use types::{ColumnInfo, QueryResult, Row, SessionId, Value};
