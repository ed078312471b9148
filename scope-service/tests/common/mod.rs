#![allow(dead_code)]

use std::sync::Arc;

use scope_service::config::CacheConfig;
use scope_service::models::{NewOrgUnit, Role, VisibilityTier};
use scope_service::services::{
    InMemoryGrantRepository, InMemoryOrgUnitRepository, InMemoryRoleRepository, MockCache,
};
use scope_service::{
    AnonymousAccess, ScopableEntityDescriptor, ScopeState, SecurityContext, SharedCache,
};

pub const TEST_TENANT_ID: i64 = 1;
pub const OTHER_TENANT_ID: i64 = 2;
pub const TEST_ACTOR_ID: i64 = 42;
pub const ORDERS_RESOURCE_TYPE: i32 = 10;

/// The visibility engine over in-memory stores and a mock distributed cache,
/// with handles to every backend for inspection and failure injection.
pub struct TestEngine {
    pub units_repo: Arc<InMemoryOrgUnitRepository>,
    pub grants_repo: Arc<InMemoryGrantRepository>,
    pub roles_repo: Arc<InMemoryRoleRepository>,
    pub shared_cache: Arc<MockCache>,
    pub state: ScopeState,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_anonymous_access(AnonymousAccess::Deny)
    }

    pub fn with_anonymous_access(anonymous_access: AnonymousAccess) -> Self {
        let units_repo = Arc::new(InMemoryOrgUnitRepository::new());
        let grants_repo = Arc::new(InMemoryGrantRepository::new());
        let roles_repo = Arc::new(InMemoryRoleRepository::new());
        let shared_cache = Arc::new(MockCache::new());

        let state = ScopeState::from_parts(
            units_repo.clone(),
            grants_repo.clone(),
            roles_repo.clone(),
            Some(shared_cache.clone() as Arc<dyn SharedCache>),
            &CacheConfig::default(),
            anonymous_access,
        );

        Self {
            units_repo,
            grants_repo,
            roles_repo,
            shared_cache,
            state,
        }
    }

    /// Tenant 1 with unit 1 (`/1/`) and its child unit 2 (`/1/2/`).
    pub async fn with_tree() -> Self {
        let engine = Self::new();
        engine.seed_tree().await;
        engine
    }

    pub async fn seed_tree(&self) {
        let root = self
            .state
            .units
            .create_unit(&NewOrgUnit::root(TEST_TENANT_ID))
            .await
            .expect("Failed to create root unit");
        assert_eq!(root.path, "/1/");

        let child = self
            .state
            .units
            .create_unit(&NewOrgUnit::child_of(TEST_TENANT_ID, root.unit_id))
            .await
            .expect("Failed to create child unit");
        assert_eq!(child.path, "/1/2/");
    }

    pub fn add_role(&self, role_id: i64, tier: VisibilityTier, actor_id: i64) {
        self.roles_repo
            .insert_role(Role {
                role_id,
                tenant_id: TEST_TENANT_ID,
                role_label: format!("role-{}", role_id),
                visibility_tier: tier.code(),
                enabled_flag: true,
            })
            .expect("Failed to insert role");
        self.roles_repo
            .assign(actor_id, role_id)
            .expect("Failed to assign role");
    }
}

/// `orders` with tenant, owner and unit columns, no grant participation.
pub fn orders() -> ScopableEntityDescriptor {
    ScopableEntityDescriptor::conventional("orders")
}

/// `orders` participating in grants through its `order_id` column.
pub fn granted_orders() -> ScopableEntityDescriptor {
    orders().with_grants(ORDERS_RESOURCE_TYPE, "order_id")
}

pub fn context(tier: VisibilityTier) -> SecurityContext {
    SecurityContext::begin(TEST_TENANT_ID, TEST_ACTOR_ID, 1, Some(tier), false)
}

pub fn order_row(tenant_id: i64, owner_id: i64, unit_id: i64, order_id: i64) -> serde_json::Value {
    serde_json::json!({
        "order_id": order_id,
        "tenant_id": tenant_id,
        "owner_id": owner_id,
        "unit_id": unit_id,
    })
}
