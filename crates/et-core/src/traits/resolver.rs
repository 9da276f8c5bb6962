//! Address resolver trait

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::ResolveError;
use crate::types::InstanceRef;

/// Turns an instance descriptor into a reachable address
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Return an externally reachable address for `instance`
    async fn resolve(&self, instance: &InstanceRef) -> Result<String, ResolveError>;
}

/// Resolver backed by a fixed name -> address table
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    addresses: HashMap<String, String>,
}

impl StaticResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `name` to `address`
    pub fn with(mut self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.addresses.insert(name.into(), address.into());
        self
    }
}

#[async_trait]
impl AddressResolver for StaticResolver {
    async fn resolve(&self, instance: &InstanceRef) -> Result<String, ResolveError> {
        self.addresses
            .get(&instance.name)
            .cloned()
            .ok_or_else(|| ResolveError::NoAddress(instance.to_string()))
    }
}
