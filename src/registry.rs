//! Lookups the booking core consumes but does not own: the service catalog,
//! the staff/branch registry and the customer registry.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use ulid::Ulid;

use crate::model::Lifecycle;

/// Failure inside a collaborator (store unreachable and the like).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("registry lookup failed: {0}")]
pub struct RegistryError(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: Ulid,
    pub tenant_id: Ulid,
    pub duration_minutes: i64,
    pub price_cents: i64,
    pub lifecycle: Lifecycle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffInfo {
    pub id: Ulid,
    pub branch_id: Ulid,
    pub tenant_id: Ulid,
    pub lifecycle: Lifecycle,
}

#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    /// Raw lookup; tenant and lifecycle filtering is the caller's job.
    async fn service(&self, service_id: Ulid) -> Result<Option<ServiceInfo>, RegistryError>;
}

#[async_trait]
pub trait StaffRegistry: Send + Sync {
    async fn staff(&self, staff_id: Ulid) -> Result<Option<StaffInfo>, RegistryError>;

    /// Active staff members of a branch.
    async fn staff_at_branch(&self, branch_id: Ulid) -> Result<Vec<StaffInfo>, RegistryError>;
}

#[async_trait]
pub trait CustomerRegistry: Send + Sync {
    async fn customer_exists(&self, customer_id: Ulid) -> Result<bool, RegistryError>;
}

/// The collaborator set injected into an engine at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub services: Arc<dyn ServiceCatalog>,
    pub staff: Arc<dyn StaffRegistry>,
    pub customers: Arc<dyn CustomerRegistry>,
}

impl Collaborators {
    /// Wire all three lookups to one in-memory registry.
    pub fn in_memory(registry: Arc<InMemoryRegistry>) -> Self {
        Self {
            services: registry.clone(),
            staff: registry.clone(),
            customers: registry,
        }
    }
}

/// DashMap-backed registry for embedding hosts without a catalog of their own,
/// and for tests.
#[derive(Default)]
pub struct InMemoryRegistry {
    services: DashMap<Ulid, ServiceInfo>,
    staff: DashMap<Ulid, StaffInfo>,
    customers: DashMap<Ulid, ()>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&self, tenant_id: Ulid, duration_minutes: i64, price_cents: i64) -> Ulid {
        let id = Ulid::new();
        self.services.insert(
            id,
            ServiceInfo {
                id,
                tenant_id,
                duration_minutes,
                price_cents,
                lifecycle: Lifecycle::Active,
            },
        );
        id
    }

    pub fn retire_service(&self, id: Ulid) {
        if let Some(mut svc) = self.services.get_mut(&id) {
            svc.lifecycle = Lifecycle::Retired;
        }
    }

    pub fn add_staff(&self, tenant_id: Ulid, branch_id: Ulid) -> Ulid {
        let id = Ulid::new();
        self.staff.insert(
            id,
            StaffInfo {
                id,
                branch_id,
                tenant_id,
                lifecycle: Lifecycle::Active,
            },
        );
        id
    }

    pub fn retire_staff(&self, id: Ulid) {
        if let Some(mut s) = self.staff.get_mut(&id) {
            s.lifecycle = Lifecycle::Retired;
        }
    }

    pub fn add_customer(&self) -> Ulid {
        let id = Ulid::new();
        self.customers.insert(id, ());
        id
    }
}

#[async_trait]
impl ServiceCatalog for InMemoryRegistry {
    async fn service(&self, service_id: Ulid) -> Result<Option<ServiceInfo>, RegistryError> {
        Ok(self.services.get(&service_id).map(|e| e.value().clone()))
    }
}

#[async_trait]
impl StaffRegistry for InMemoryRegistry {
    async fn staff(&self, staff_id: Ulid) -> Result<Option<StaffInfo>, RegistryError> {
        Ok(self.staff.get(&staff_id).map(|e| e.value().clone()))
    }

    async fn staff_at_branch(&self, branch_id: Ulid) -> Result<Vec<StaffInfo>, RegistryError> {
        let mut found: Vec<StaffInfo> = self
            .staff
            .iter()
            .filter(|e| e.branch_id == branch_id && e.lifecycle == Lifecycle::Active)
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|s| s.id);
        Ok(found)
    }
}

#[async_trait]
impl CustomerRegistry for InMemoryRegistry {
    async fn customer_exists(&self, customer_id: Ulid) -> Result<bool, RegistryError> {
        Ok(self.customers.contains_key(&customer_id))
    }
}
