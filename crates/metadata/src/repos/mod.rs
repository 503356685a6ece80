//! Repository traits for metadata operations.

pub mod bootstrap;
pub mod repositories;
pub mod tokens;
pub mod uploads;

pub use bootstrap::BootstrapRepo;
pub use repositories::RepositoryRepo;
pub use tokens::TokenRepo;
pub use uploads::UploadRepo;
