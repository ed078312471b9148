pub mod context;

pub use context::{security_context_middleware, RequestSecurityContext};
