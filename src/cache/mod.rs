//! icebreak query cache
//!
//! Client-side cache for remote reads:
//!
//! - **Store**: canonical key → entry (data, timestamp, policy, status), with
//!   per-key and global change listeners
//! - **Query client**: serves fresh data, serves stale data while refreshing,
//!   or suspends the caller on a deduplicated fetch
//! - **Mutations**: writes that invalidate dependent reads on success
//!
//! ## Configuration
//!
//! Preset policies can be retuned via `icebreak.toml`:
//!
//! ```toml
//! [cache.policies.external]
//! ttl_ms = 15000
//! stale_while_revalidate = true
//! ```

mod bridge;
mod clock;
mod config;
mod entry;
mod error;
mod events;
mod inflight;
pub mod keys;
mod lock;
mod mutation;
mod policy;
mod prefetch;
mod query;
mod registry;
mod store;

pub use bridge::{KeyWatch, QueryWatch, StoreWatch};
pub use clock::{Clock, EpochMillis, ManualClock, SystemClock};
pub use config::{CacheConfig, PolicyOverride};
pub use entry::{CacheEntry, CacheStatus, CachedValue};
pub use error::{FetchError, QueryError};
pub use events::{ChangeKind, Epoch, StoreEvent};
pub use keys::{CacheKey, KeyPattern, KeyPredicate};
pub use mutation::{Mutation, MutationOptions, MutationStatus};
pub use policy::{CachePolicy, PolicyPreset};
pub use query::{QueryClient, QueryState, Suspension};
pub use registry::{Listener, Subscription};
pub use store::CacheStore;
