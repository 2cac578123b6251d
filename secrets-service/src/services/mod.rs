//! Services layer for secrets-service.
//!
//! Identity resolution, access control, the audit trail and the domain
//! operations composed from them. Persistence sits behind the `Store` trait.

pub mod access;
pub mod audit;
pub mod cipher;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod organizations;
pub mod projects;
pub mod secrets;
pub mod store;
pub mod users;

pub use access::AccessControl;
pub use audit::AuditTrail;
pub use cipher::Cipher;
pub use error::ServiceError;
pub use identity::{Actor, CallerIdentity, IdentityResolver};
pub use metrics::Metrics;
pub use organizations::OrganizationService;
pub use projects::ProjectService;
pub use secrets::SecretService;
pub use store::{MemoryStore, PostgresStore, Store};
pub use users::UserService;
