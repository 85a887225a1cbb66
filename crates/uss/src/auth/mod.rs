//! Authentication: the authority token broker for outbound federation, the
//! shared JWKS verifier cache, and the scope-enforcing gate for inbound
//! requests.

pub mod audience;
pub mod broker;
pub mod jwks;
pub mod scopes;
