//! Repository and predicate behaviour against a live PostgreSQL.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`.

use std::sync::Arc;

use chrono::Utc;
use scope_service::config::{CacheConfig, DatabaseConfig};
use scope_service::db;
use scope_service::models::{ActorSet, GrantScope, NewOrgUnit, UnitSet, VisibilityTier};
use scope_service::services::{PgGrantRepository, PgOrgUnitRepository, PgRoleRepository};
use scope_service::{
    AnonymousAccess, GrantRepository, ScopableEntityDescriptor, ScopeError, ScopeState,
    ScopedQuery, SecurityContext,
};
use sqlx::{PgPool, Postgres, QueryBuilder};

const ORDERS_TABLE: &str = "scope_test_orders";

async fn setup_pool() -> PgPool {
    let config = DatabaseConfig {
        url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/scope_test".to_string()),
        max_connections: 5,
        min_connections: 1,
    };
    let pool = db::create_pool(&config)
        .await
        .expect("Failed to connect to PostgreSQL");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

/// Fresh id per test run so rows of earlier runs never interfere.
fn unique_id() -> i64 {
    Utc::now().timestamp_micros()
}

fn pg_state(pool: &PgPool) -> ScopeState {
    ScopeState::from_parts(
        Arc::new(PgOrgUnitRepository::new(pool.clone())),
        Arc::new(PgGrantRepository::new(pool.clone())),
        Arc::new(PgRoleRepository::new(pool.clone())),
        None,
        &CacheConfig::default(),
        AnonymousAccess::Deny,
    )
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn move_rebases_subtree_in_store() {
    let pool = setup_pool().await;
    let state = pg_state(&pool);
    let tenant_id = unique_id();

    let root = state.units.create_unit(&NewOrgUnit::root(tenant_id)).await.unwrap();
    let child = state
        .units
        .create_unit(&NewOrgUnit::child_of(tenant_id, root.unit_id))
        .await
        .unwrap();
    let grandchild = state
        .units
        .create_unit(&NewOrgUnit::child_of(tenant_id, child.unit_id))
        .await
        .unwrap();
    assert_eq!(
        grandchild.path,
        format!("/{}/{}/{}/", root.unit_id, child.unit_id, grandchild.unit_id)
    );

    let other_root = state.units.create_unit(&NewOrgUnit::root(tenant_id)).await.unwrap();

    let moved = state
        .units
        .move_unit(tenant_id, child.unit_id, other_root.unit_id)
        .await
        .expect("Failed to move unit");
    assert_eq!(moved.parent_id, other_root.unit_id);

    let rebased = state
        .units
        .find_unit(tenant_id, grandchild.unit_id)
        .await
        .unwrap()
        .expect("Grandchild disappeared");
    assert_eq!(
        rebased.path,
        format!("/{}/{}/{}/", other_root.unit_id, child.unit_id, grandchild.unit_id)
    );
    assert_eq!(rebased.depth, 3);

    assert_eq!(
        state
            .units
            .resolve_accessible_units(tenant_id, root.unit_id, true)
            .await
            .unwrap(),
        UnitSet::from([root.unit_id])
    );
    assert_eq!(
        state
            .units
            .resolve_accessible_units(tenant_id, other_root.unit_id, true)
            .await
            .unwrap(),
        UnitSet::from([other_root.unit_id, child.unit_id, grandchild.unit_id])
    );

    // below its own descendant
    let err = state
        .units
        .move_unit(tenant_id, other_root.unit_id, grandchild.unit_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ScopeError::InvalidMove(_)));
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn crossed_moves_never_form_a_cycle() {
    let pool = setup_pool().await;
    let state = pg_state(&pool);
    let tenant_id = unique_id();

    let a = state.units.create_unit(&NewOrgUnit::root(tenant_id)).await.unwrap();
    let b = state.units.create_unit(&NewOrgUnit::root(tenant_id)).await.unwrap();

    let (a_under_b, b_under_a) = tokio::join!(
        state.units.move_unit(tenant_id, a.unit_id, b.unit_id),
        state.units.move_unit(tenant_id, b.unit_id, a.unit_id),
    );
    assert!(
        a_under_b.is_ok() != b_under_a.is_ok(),
        "exactly one crossed move must win"
    );
    let rejected = a_under_b.err().or(b_under_a.err()).unwrap();
    assert!(matches!(rejected, ScopeError::InvalidMove(_)));

    for unit_id in [a.unit_id, b.unit_id] {
        let unit = state.units.find_unit(tenant_id, unit_id).await.unwrap().unwrap();
        assert!(unit.path.ends_with(&format!("/{}/", unit_id)));
        if !unit.is_root() {
            let parent = state
                .units
                .find_unit(tenant_id, unit.parent_id)
                .await
                .unwrap()
                .unwrap();
            assert!(parent.is_root());
            assert_eq!(unit.path, format!("{}{}/", parent.path, unit_id));
        }
    }
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn replace_and_revoke_grants_in_store() {
    let pool = setup_pool().await;
    let state = pg_state(&pool);
    let base = unique_id();
    let (resource_id, resource_type) = (base, 10);
    let (a, b, c) = (base + 1, base + 2, base + 3);

    state
        .grants
        .replace_for_resource(resource_id, resource_type, [a, b], GrantScope::View)
        .await
        .unwrap();
    let previous = state
        .grants
        .replace_for_resource(resource_id, resource_type, [a, c], GrantScope::Edit)
        .await
        .unwrap();
    assert_eq!(previous, ActorSet::from([a, b]));

    assert_eq!(
        state
            .grants
            .list_actors_for_resource(resource_id, resource_type)
            .await
            .unwrap(),
        ActorSet::from([a, c])
    );
    // the soft-deleted row of `a` was revived with the new scope
    assert!(state
        .grants
        .has_grant(a, resource_id, resource_type, GrantScope::Edit)
        .await
        .unwrap());
    assert!(state
        .grants
        .list_resource_ids_for_actor(b, resource_type)
        .await
        .unwrap()
        .is_empty());

    assert!(state.grants.remove(c, resource_id, resource_type).await.unwrap());
    assert!(!state.grants.remove(c, resource_id, resource_type).await.unwrap());

    assert_eq!(
        state
            .grants
            .revoke_all_for_resource(resource_id, resource_type)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn concurrent_replacements_keep_one_actor_list() {
    let pool = setup_pool().await;
    let base = unique_id();
    let (resource_id, resource_type) = (base, 11);
    let lists: Vec<ActorSet> = (0..4)
        .map(|i| ActorSet::from([base + 10 * i + 1, base + 10 * i + 2]))
        .collect();

    let mut handles = Vec::new();
    for actors in lists.clone() {
        let repo = PgGrantRepository::new(pool.clone());
        handles.push(tokio::spawn(async move {
            repo.replace_for_resource(resource_id, resource_type, &actors, GrantScope::View)
                .await
        }));
    }

    let mut displaced = ActorSet::new();
    for handle in handles {
        let previous = handle.await.unwrap().expect("Failed to replace grants");
        displaced.extend(previous);
    }

    let repo = PgGrantRepository::new(pool.clone());
    let current = repo
        .actors_for_resource(resource_id, resource_type)
        .await
        .unwrap();
    assert!(lists.contains(&current), "interleaved replace left {:?}", current);

    // every list except the surviving one was reported as displaced exactly once
    let expected: ActorSet = lists
        .iter()
        .filter(|actors| **actors != current)
        .flatten()
        .copied()
        .collect();
    assert_eq!(displaced, expected);
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn replacement_reports_concurrently_added_actor() {
    let pool = setup_pool().await;
    let repo = PgGrantRepository::new(pool.clone());
    let base = unique_id();
    let (resource_id, resource_type, late_actor) = (base, 12, base + 9);

    let first = ActorSet::from([base + 1]);
    repo.replace_for_resource(resource_id, resource_type, &first, GrantScope::View)
        .await
        .unwrap();
    // an add committed before the replacement starts its rewrite
    repo.upsert(late_actor, resource_id, resource_type, GrantScope::View)
        .await
        .unwrap();

    let second = ActorSet::from([base + 2]);
    let previous = repo
        .replace_for_resource(resource_id, resource_type, &second, GrantScope::View)
        .await
        .unwrap();
    assert_eq!(previous, ActorSet::from([base + 1, late_actor]));
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn scoped_query_filters_rows_in_store() {
    let pool = setup_pool().await;
    let state = pg_state(&pool);
    let tenant_id = unique_id();
    let actor_id = tenant_id + 1;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            order_id BIGINT PRIMARY KEY,
            tenant_id BIGINT NOT NULL,
            owner_id BIGINT NOT NULL,
            unit_id BIGINT NOT NULL
        )",
        ORDERS_TABLE
    ))
    .execute(&pool)
    .await
    .unwrap();

    let root = state.units.create_unit(&NewOrgUnit::root(tenant_id)).await.unwrap();
    let child = state
        .units
        .create_unit(&NewOrgUnit::child_of(tenant_id, root.unit_id))
        .await
        .unwrap();
    let sibling = state.units.create_unit(&NewOrgUnit::root(tenant_id)).await.unwrap();

    let rows = [
        (tenant_id, actor_id, sibling.unit_id),
        (tenant_id, 7, root.unit_id),
        (tenant_id, 7, child.unit_id),
        (tenant_id, 7, sibling.unit_id),
        (tenant_id + 100, actor_id, root.unit_id),
    ];
    for (i, &(tenant, owner, unit)) in rows.iter().enumerate() {
        sqlx::query(&format!(
            "INSERT INTO {} (order_id, tenant_id, owner_id, unit_id) VALUES ($1, $2, $3, $4)",
            ORDERS_TABLE
        ))
        .bind(tenant_id * 10 + i as i64)
        .bind(tenant)
        .bind(owner)
        .bind(unit)
        .execute(&pool)
        .await
        .unwrap();
    }

    let ctx = SecurityContext::begin(
        tenant_id,
        actor_id,
        root.unit_id,
        Some(VisibilityTier::UnitSubtree),
        false,
    );
    let query = state
        .resolver
        .apply(
            ScopedQuery::new(ORDERS_TABLE),
            &ScopableEntityDescriptor::conventional(ORDERS_TABLE),
            &ctx,
        )
        .await
        .unwrap();

    let mut builder =
        QueryBuilder::<Postgres>::new(format!("SELECT order_id FROM {}", ORDERS_TABLE));
    query.push_where(&mut builder);
    builder.push(" ORDER BY order_id");

    let visible: Vec<(i64,)> = builder.build_query_as().fetch_all(&pool).await.unwrap();
    let visible: Vec<i64> = visible.into_iter().map(|(id,)| id).collect();

    assert_eq!(
        visible,
        vec![tenant_id * 10, tenant_id * 10 + 1, tenant_id * 10 + 2]
    );
}
