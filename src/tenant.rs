//! Explicit tenancy and actor values threaded through the pipeline.
//!
//! There is deliberately no ambient "current tenant" — every operation that
//! touches tenant-partitioned state takes a `TenantContext` argument, which
//! makes cross-tenant writes impossible to express by accident.

/// The tenant on whose behalf an upload runs. Every persisted artifact path
/// starts with `tenants/{tenant_id}/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: String,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
        }
    }
}

/// The authenticated principal performing the upload. Used for rate limiting
/// and log correlation; authorization itself happens before the pipeline is
/// invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}
