//! Repositories over the per-tenant schemas.

pub mod passwords;
pub mod pods;
pub mod repository;
pub mod snapshots;
pub mod volumes;

pub use passwords::Passwords;
pub use pods::Pods;
pub use repository::Repository;
pub use snapshots::Snapshots;
pub use volumes::Volumes;
