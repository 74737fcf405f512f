//! Capability negotiation
//!
//! Generic callers ask what an engine can do instead of matching on engine
//! names. All answers come from the static descriptor.

use rela_core::{Capability, CapabilitySet, EngineError, EngineResult};
use rela_sql::QuoteStyle;

use crate::engine::descriptor::EngineDescriptor;

pub fn capabilities(descriptor: &EngineDescriptor) -> CapabilitySet {
    descriptor.capabilities
}

pub fn supports(descriptor: &EngineDescriptor, capability: Capability) -> bool {
    descriptor.capabilities.contains(capability)
}

/// Fails with `UnsupportedCapability` when the engine lacks `capability`.
pub fn require(descriptor: &EngineDescriptor, capability: Capability) -> EngineResult<()> {
    if supports(descriptor, capability) {
        Ok(())
    } else {
        Err(EngineError::unsupported(format!(
            "{} does not support {}",
            descriptor.name, capability
        )))
    }
}

pub fn quote_style(descriptor: &EngineDescriptor) -> QuoteStyle {
    descriptor.dialect.quote_style()
}
