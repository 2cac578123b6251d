pub mod dotenv;
pub mod slug;
pub mod validation;

pub use slug::normalize_slug;
pub use validation::{ValidatedJson, ValidatedPath, ValidatedQuery};
