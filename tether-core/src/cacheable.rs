//! The capability shared by everything that can be cached.

use std::sync::{Mutex, PoisonError};

use crate::{CacheOptions, EntityRole, KeySource, SubscriptionId};

/// Capability interface implemented by [`Record`](crate::Record) and
/// [`Group`](crate::Group).
///
/// Cache adapters only see entities through this trait when deriving keys
/// and tracking enable state.
pub trait Cacheable: Send + Sync {
    /// Entity kind, e.g. `"todo"`.
    fn kind(&self) -> &str;

    fn role(&self) -> EntityRole;

    fn key_source(&self) -> Option<&KeySource>;

    /// Identifier used in key derivation. Groups have none.
    fn identity(&self) -> Option<String>;

    /// An exact key that overrides derivation, if one is pinned.
    fn pinned_key(&self) -> Option<String> {
        None
    }

    fn cache_state(&self) -> &CacheState;
}

#[derive(Debug, Default)]
struct CacheSlot {
    enabled: bool,
    options: CacheOptions,
    subscriptions: Vec<SubscriptionId>,
}

/// Per-entity cache state: enabled flag, options and installed subscriptions.
#[derive(Debug, Default)]
pub struct CacheState {
    slot: Mutex<CacheSlot>,
}

impl CacheState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).enabled
    }

    /// Options recorded at enable time.
    pub fn options(&self) -> CacheOptions {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .options
            .clone()
    }

    /// Mark enabled with the given options.
    ///
    /// Returns `false` without touching anything when already enabled.
    pub fn try_enable(&self, options: CacheOptions) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.enabled {
            return false;
        }
        slot.enabled = true;
        slot.options = options;
        true
    }

    /// Remember subscriptions so they can be removed on disable.
    pub fn attach(&self, subscriptions: impl IntoIterator<Item = SubscriptionId>) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions
            .extend(subscriptions);
    }

    pub fn subscription_count(&self) -> usize {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions
            .len()
    }

    /// Mark disabled and hand back the subscriptions to remove.
    ///
    /// Options are kept so a later key derivation still addresses the same
    /// slot.
    pub fn disable(&self) -> Vec<SubscriptionId> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.enabled = false;
        std::mem::take(&mut slot.subscriptions)
    }
}
