//! End-to-end visibility resolution over the in-memory engine.

mod common;

use common::{
    context, granted_orders, order_row, orders, TestEngine, ORDERS_RESOURCE_TYPE,
    OTHER_TENANT_ID, TEST_ACTOR_ID, TEST_TENANT_ID,
};
use scope_service::models::{GrantScope, UnitSet, VisibilityTier};
use scope_service::{
    AnonymousAccess, Predicate, ScopableEntityDescriptor, ScopedQuery, SecurityContext,
};
use sqlx::{Postgres, QueryBuilder};

const ALL_TIERS: [VisibilityTier; 4] = [
    VisibilityTier::SelfOnly,
    VisibilityTier::Unit,
    VisibilityTier::UnitSubtree,
    VisibilityTier::All,
];

#[tokio::test]
async fn unit_subtree_actor_sees_own_rows_and_subtree_units() {
    let engine = TestEngine::with_tree().await;
    let ctx = context(VisibilityTier::UnitSubtree);

    let query = engine
        .state
        .resolver
        .apply(ScopedQuery::new("orders"), &orders(), &ctx)
        .await
        .expect("Failed to apply scope");

    assert_eq!(
        query.clauses(),
        &[
            Predicate::eq("tenant_id", TEST_TENANT_ID),
            Predicate::or([
                Predicate::eq("owner_id", TEST_ACTOR_ID),
                Predicate::in_set("unit_id", [1, 2]),
            ]),
        ]
    );

    assert!(query.matches(&order_row(1, 42, 9, 100)));
    assert!(query.matches(&order_row(1, 7, 2, 101)));
    assert!(!query.matches(&order_row(1, 7, 3, 102)));
    assert!(!query.matches(&order_row(2, 42, 1, 103)));
}

#[tokio::test]
async fn all_tier_dominates_grant_participation() {
    let engine = TestEngine::with_tree().await;
    let ctx = context(VisibilityTier::All);

    let query = engine
        .state
        .resolver
        .apply(ScopedQuery::new("orders"), &granted_orders(), &ctx)
        .await
        .expect("Failed to apply scope");

    assert_eq!(query.clauses(), &[Predicate::eq("tenant_id", TEST_TENANT_ID)]);
    // the grant leg is never evaluated for ALL
    assert_eq!(engine.grants_repo.actor_reads(), 0);
}

#[tokio::test]
async fn self_tier_is_owner_only() {
    let engine = TestEngine::with_tree().await;
    let ctx = context(VisibilityTier::SelfOnly);

    let query = engine
        .state
        .resolver
        .apply(ScopedQuery::new("orders"), &orders(), &ctx)
        .await
        .expect("Failed to apply scope");

    assert_eq!(
        query.clauses(),
        &[
            Predicate::eq("tenant_id", TEST_TENANT_ID),
            Predicate::eq("owner_id", TEST_ACTOR_ID),
        ]
    );
    assert!(query.matches(&order_row(1, 42, 2, 100)));
    assert!(!query.matches(&order_row(1, 7, 1, 101)));
}

#[tokio::test]
async fn missing_tier_fails_closed_to_self() {
    let engine = TestEngine::with_tree().await;
    let ctx = SecurityContext::begin(TEST_TENANT_ID, TEST_ACTOR_ID, 1, None, false);

    let clauses = engine
        .state
        .resolver
        .visibility_clauses(&orders(), &ctx)
        .await
        .expect("Failed to resolve clauses");

    assert_eq!(clauses[1], Predicate::eq("owner_id", TEST_ACTOR_ID));
}

#[tokio::test]
async fn admin_gets_tenant_clause_only_for_every_tier() {
    let engine = TestEngine::with_tree().await;

    for tier in ALL_TIERS {
        let ctx = SecurityContext::begin(TEST_TENANT_ID, TEST_ACTOR_ID, 1, Some(tier), true);
        let clauses = engine
            .state
            .resolver
            .visibility_clauses(&granted_orders(), &ctx)
            .await
            .expect("Failed to resolve clauses");
        assert_eq!(clauses, vec![Predicate::eq("tenant_id", TEST_TENANT_ID)], "tier {}", tier);
    }
}

#[tokio::test]
async fn every_matched_row_belongs_to_the_callers_tenant() {
    let engine = TestEngine::with_tree().await;
    engine
        .state
        .grants
        .add(TEST_ACTOR_ID, 500, ORDERS_RESOURCE_TYPE, GrantScope::View)
        .await
        .expect("Failed to add grant");

    let mut rows = Vec::new();
    let mut order_id = 499;
    for tenant in [TEST_TENANT_ID, OTHER_TENANT_ID] {
        for owner in [TEST_ACTOR_ID, 7] {
            for unit in [1, 2, 3] {
                order_id += 1;
                rows.push(order_row(tenant, owner, unit, order_id));
            }
        }
    }

    for tier in ALL_TIERS {
        for descriptor in [orders(), granted_orders()] {
            let ctx = context(tier);
            let query = engine
                .state
                .resolver
                .apply(ScopedQuery::new("orders"), &descriptor, &ctx)
                .await
                .expect("Failed to apply scope");

            let matched: Vec<_> = rows.iter().filter(|row| query.matches(row)).collect();
            assert!(!matched.is_empty(), "tier {} matched nothing", tier);
            for row in matched {
                assert_eq!(row["tenant_id"], TEST_TENANT_ID, "tier {} leaked {}", tier, row);
            }
        }
    }
}

#[tokio::test]
async fn grants_widen_sub_all_tiers() {
    let engine = TestEngine::with_tree().await;
    engine
        .state
        .grants
        .add(TEST_ACTOR_ID, 500, ORDERS_RESOURCE_TYPE, GrantScope::View)
        .await
        .expect("Failed to add grant");
    let ctx = context(VisibilityTier::Unit);

    let query = engine
        .state
        .resolver
        .apply(ScopedQuery::new("orders"), &granted_orders(), &ctx)
        .await
        .expect("Failed to apply scope");

    // unit 9 is outside the actor's unit, reachable only through the grant
    assert!(query.matches(&order_row(1, 7, 9, 500)));
    assert!(!query.matches(&order_row(1, 7, 9, 501)));
    assert!(query.matches(&order_row(1, 7, 1, 501)));
    assert!(!query.matches(&order_row(2, 7, 9, 500)));
}

#[tokio::test]
async fn empty_grant_leg_drops_out() {
    let engine = TestEngine::with_tree().await;
    let ctx = context(VisibilityTier::SelfOnly);

    let clauses = engine
        .state
        .resolver
        .visibility_clauses(&granted_orders(), &ctx)
        .await
        .expect("Failed to resolve clauses");

    assert_eq!(
        clauses,
        vec![
            Predicate::eq("tenant_id", TEST_TENANT_ID),
            Predicate::eq("owner_id", TEST_ACTOR_ID),
        ]
    );
    assert_eq!(engine.grants_repo.actor_reads(), 1);
}

#[tokio::test]
async fn anonymous_context_is_denied_by_default() {
    let engine = TestEngine::with_tree().await;
    let anonymous = SecurityContext::begin(0, 0, 0, Some(VisibilityTier::All), false);

    let query = engine
        .state
        .resolver
        .apply(ScopedQuery::new("orders"), &orders(), &anonymous)
        .await
        .expect("Failed to apply scope");

    assert_eq!(query.clauses(), &[Predicate::False]);
    assert!(!query.matches(&order_row(1, 42, 1, 100)));

    let tenant_only = SecurityContext::begin(TEST_TENANT_ID, 0, 1, None, false);
    let clauses = engine
        .state
        .resolver
        .visibility_clauses(&orders(), &tenant_only)
        .await
        .expect("Failed to resolve clauses");
    assert_eq!(clauses, vec![Predicate::False]);
}

#[tokio::test]
async fn anonymous_context_is_unfiltered_only_when_opted_in() {
    let engine = TestEngine::with_anonymous_access(AnonymousAccess::Unfiltered);
    let anonymous = SecurityContext::begin(0, 0, 0, None, false);

    let query = engine
        .state
        .resolver
        .apply(ScopedQuery::new("orders"), &orders(), &anonymous)
        .await
        .expect("Failed to apply scope");

    assert!(query.is_unfiltered());
}

#[tokio::test]
async fn system_context_is_unfiltered() {
    let engine = TestEngine::with_tree().await;
    let query = engine
        .state
        .resolver
        .apply(ScopedQuery::new("orders"), &orders(), &SecurityContext::system())
        .await
        .expect("Failed to apply scope");
    assert!(query.is_unfiltered());
}

#[tokio::test]
async fn suppressed_scope_is_unfiltered_until_guard_drops() {
    let engine = TestEngine::with_tree().await;
    let ctx = context(VisibilityTier::SelfOnly);

    {
        let _suppressed = ctx.suppress_scope();
        let query = engine
            .state
            .resolver
            .apply(ScopedQuery::new("orders"), &orders(), &ctx)
            .await
            .expect("Failed to apply scope");
        assert!(query.is_unfiltered());
    }

    let query = engine
        .state
        .resolver
        .apply(ScopedQuery::new("orders"), &orders(), &ctx)
        .await
        .expect("Failed to apply scope");
    assert_eq!(query.clauses().len(), 2);
}

#[tokio::test]
async fn overlapping_suppressions_in_concurrent_branches_restore_filtering() {
    let engine = TestEngine::with_tree().await;
    let ctx = context(VisibilityTier::SelfOnly);

    let branch = |millis: u64| {
        let engine = &engine;
        let ctx = &ctx;
        async move {
            let _suppressed = ctx.suppress_scope();
            tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
            engine
                .state
                .resolver
                .apply(ScopedQuery::new("orders"), &orders(), ctx)
                .await
                .expect("Failed to apply scope")
        }
    };
    let (short, long) = tokio::join!(branch(10), branch(30));
    assert!(short.is_unfiltered());
    assert!(long.is_unfiltered());

    // the shorter branch released its guard first
    let query = engine
        .state
        .resolver
        .apply(ScopedQuery::new("orders"), &orders(), &ctx)
        .await
        .expect("Failed to apply scope");
    assert!(!ctx.is_scope_disabled());
    assert_eq!(
        query.clauses(),
        &[
            Predicate::eq("tenant_id", TEST_TENANT_ID),
            Predicate::eq("owner_id", TEST_ACTOR_ID),
        ]
    );
}

#[tokio::test]
async fn multi_unit_column_matches_any_member() {
    let engine = TestEngine::with_tree().await;
    let tasks = ScopableEntityDescriptor::new("tasks")
        .with_tenant_column("tenant_id")
        .with_multi_unit_column("unit_ids");
    let ctx = SecurityContext::begin(TEST_TENANT_ID, TEST_ACTOR_ID, 2, Some(VisibilityTier::Unit), false);

    let query = engine
        .state
        .resolver
        .apply(ScopedQuery::new("tasks"), &tasks, &ctx)
        .await
        .expect("Failed to apply scope");

    assert!(query.matches(&serde_json::json!({"tenant_id": 1, "unit_ids": [5, 2]})));
    assert!(!query.matches(&serde_json::json!({"tenant_id": 1, "unit_ids": [5, 1]})));
    assert!(!query.matches(&serde_json::json!({"tenant_id": 1, "unit_ids": []})));
}

#[tokio::test]
async fn additional_units_are_unioned_into_the_unit_leg() {
    let engine = TestEngine::with_tree().await;
    let ctx = SecurityContext::begin(TEST_TENANT_ID, TEST_ACTOR_ID, 2, Some(VisibilityTier::Unit), false)
        .with_additional_units([7]);

    let clauses = engine
        .state
        .resolver
        .visibility_clauses(&orders(), &ctx)
        .await
        .expect("Failed to resolve clauses");

    assert_eq!(
        clauses[1],
        Predicate::or([
            Predicate::eq("owner_id", TEST_ACTOR_ID),
            Predicate::in_set("unit_id", [2, 7]),
        ])
    );
}

#[tokio::test]
async fn actor_without_unit_falls_back_to_owner() {
    let engine = TestEngine::with_tree().await;
    let ctx = SecurityContext::begin(
        TEST_TENANT_ID,
        TEST_ACTOR_ID,
        0,
        Some(VisibilityTier::UnitSubtree),
        false,
    );

    let clauses = engine
        .state
        .resolver
        .visibility_clauses(&orders(), &ctx)
        .await
        .expect("Failed to resolve clauses");

    assert_eq!(clauses[1], Predicate::eq("owner_id", TEST_ACTOR_ID));
}

#[tokio::test]
async fn accessible_units_are_memoized_per_request() {
    let engine = TestEngine::with_tree().await;
    let ctx = context(VisibilityTier::UnitSubtree);

    for _ in 0..3 {
        engine
            .state
            .resolver
            .apply(ScopedQuery::new("orders"), &orders(), &ctx)
            .await
            .expect("Failed to apply scope");
    }

    assert_eq!(ctx.cached_units(true), Some(UnitSet::from([1, 2])));
    assert_eq!(engine.units_repo.subtree_reads(), 1);
}

#[tokio::test]
async fn creator_registration_grants_owner_access() {
    let engine = TestEngine::with_tree().await;
    let scripts = granted_orders().register_creator_as_owner();
    let ctx = context(VisibilityTier::SelfOnly);
    let resolver = &engine.state.resolver;

    assert!(resolver.register_creator(&scripts, &ctx, 900).await.unwrap());
    assert!(resolver
        .can_access_resource(&scripts, &ctx, 900, GrantScope::Owner)
        .await
        .unwrap());

    let other = SecurityContext::begin(TEST_TENANT_ID, 7, 1, Some(VisibilityTier::SelfOnly), false);
    assert!(!resolver
        .can_access_resource(&scripts, &other, 900, GrantScope::View)
        .await
        .unwrap());

    let admin = SecurityContext::begin(TEST_TENANT_ID, 7, 1, None, true);
    assert!(resolver
        .can_access_resource(&scripts, &admin, 900, GrantScope::Owner)
        .await
        .unwrap());

    // without opting in, nothing is registered
    assert!(!resolver.register_creator(&granted_orders(), &ctx, 901).await.unwrap());
}

#[tokio::test]
async fn scoped_query_renders_parameterised_where_clause() {
    let engine = TestEngine::with_tree().await;
    let ctx = context(VisibilityTier::UnitSubtree);

    let query = engine
        .state
        .resolver
        .apply(ScopedQuery::new("orders"), &orders(), &ctx)
        .await
        .expect("Failed to apply scope");

    let mut builder = QueryBuilder::<Postgres>::new("SELECT * FROM orders");
    query.push_where(&mut builder);

    assert_eq!(
        builder.sql(),
        "SELECT * FROM orders WHERE \"orders\".\"tenant_id\" = $1 AND \
         (\"orders\".\"owner_id\" = $2 OR \"orders\".\"unit_id\" = ANY($3))"
    );
}
