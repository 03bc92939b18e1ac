//! tether Core - Entity Types
//!
//! Records, groups, the capability trait cache adapters work against, the
//! typed event bus the remote sync source emits on, configuration and the
//! error taxonomy. No store access lives here.

mod cacheable;
mod config;
mod error;
mod event;
mod group;
mod key_source;
mod record;

pub use cacheable::{CacheState, Cacheable};
pub use config::{CacheConfig, CacheOptions, RehydrationStrategy, FALLBACK_PREFIX};
pub use error::{ConfigError, RehydrationError, StoreError, TetherError, TetherResult};
pub use event::{EventBus, EventHandler, GroupEvent, RecordEvent, SubscriptionId};
pub use group::Group;
pub use key_source::{EntityRole, KeyContext, KeyFn, KeySource};
pub use record::{
    Attributes, Mutation, Record, RecordFactory, RecordTemplate, DEFAULT_ID_ATTRIBUTE,
};
