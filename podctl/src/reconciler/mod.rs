//! Health reconcilers: the periodic loops that make stored state and observed
//! cluster/filesystem state converge.
//!
//! Two loops run per process:
//!
//! - [`host::HostReconciler`]: pod lifecycle sweep against running workloads.
//! - [`site::SiteReconciler`]: shared-filesystem hygiene and proxy config.
//!
//! Both are timer-driven, idempotent per pass, and treat compare-and-swap
//! conflicts as another actor having already converged the entity.

pub mod host;
pub mod proxy;
pub mod site;

pub use host::HostReconciler;
pub use proxy::ProxyRoutes;
pub use site::SiteReconciler;
