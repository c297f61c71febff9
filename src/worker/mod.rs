//! Offline cache router modelled on a browser service worker.
//!
//! - Classifies each GET as API, static asset, navigation or other
//! - Network-first for API, cache-first for static assets,
//!   stale-while-revalidate for navigations
//! - Precaches a manifest on install and drops old cache generations on
//!   activate
//! - Dispatches background sync and push events

mod events;
mod lifecycle;
mod router;

pub use events::{Notification, Notifier, SyncReplay};
pub use lifecycle::{ServiceWorker, WorkerMessage, WorkerState};
pub use router::{CacheRouter, RouteRules};
