//! Security context middleware.
//!
//! Runs after the authentication layer. It reads the [`Actor`] that layer
//! placed in the request extensions, resolves the actor's visibility tier and
//! inserts an `Arc<SecurityContext>` for downstream handlers.

use std::ops::Deref;
use std::sync::Arc;

use service_core::{
    axum::{
        async_trait,
        extract::{FromRequestParts, Request, State},
        http::request::Parts,
        middleware::Next,
        response::Response,
    },
    error::AppError,
};

use crate::context::SecurityContext;
use crate::models::{Actor, VisibilityTier};
use crate::services::VisibilityTierResolver;

/// Establish the request's [`SecurityContext`]. Requests without an
/// authenticated actor pass through without one; handlers that need it
/// reject them through [`RequestSecurityContext`].
pub async fn security_context_middleware(
    State(tiers): State<VisibilityTierResolver>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let actor = request.extensions().get::<Actor>().cloned();

    if let Some(actor) = actor {
        let tier = if actor.is_admin {
            VisibilityTier::All
        } else {
            tiers.resolve(actor.actor_id).await?
        };

        tracing::debug!(
            tenant_id = actor.tenant_id,
            actor_id = actor.actor_id,
            unit_id = actor.unit_id,
            %tier,
            "Security context established"
        );
        request
            .extensions_mut()
            .insert(Arc::new(SecurityContext::for_actor(&actor, Some(tier))));
    }

    Ok(next.run(request).await)
}

/// Extractor for the request's security context.
///
/// ```ignore
/// async fn handler(ctx: RequestSecurityContext) -> impl IntoResponse {
///     let query = resolver.apply(ScopedQuery::new("orders"), &descriptor, &ctx).await?;
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RequestSecurityContext(pub Arc<SecurityContext>);

impl Deref for RequestSecurityContext {
    type Target = SecurityContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestSecurityContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Arc<SecurityContext>>()
            .cloned()
            .map(RequestSecurityContext)
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Security context not found")))
    }
}
