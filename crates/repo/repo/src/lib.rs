mod error;
mod repository;

pub use error::RepoError;
pub use repository::{ImpressionFlags, Repository};
