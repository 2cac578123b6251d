pub mod audit_log;
pub mod invitation;
pub mod membership;
pub mod organization;
pub mod project;
pub mod secret;
pub mod user;

pub use audit_log::{AuditAction, AuditLog, AuditResource};
pub use invitation::Invitation;
pub use membership::{MemberDetail, Membership, Role, Scope, ScopeKind};
pub use organization::Organization;
pub use project::{Project, ProjectOverview};
pub use secret::{Environment, NewSecretValue, Secret, SecretValue, SecretWithValues};
pub use user::{ExternalProfile, Session, User, UserSummary};
