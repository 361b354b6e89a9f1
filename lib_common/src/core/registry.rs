//! # Channel Registry
//!
//! Explicit, process-lifetime map from channel id to `ChannelState`. Built once
//! at startup by the orchestrator's owner and handed out as `Arc<ChannelRegistry>`
//! to the live subscriber and the gap poller.
//!
//! Registration is a sequential setup step. Cursor writes come only from the
//! poller task owning that channel, so the lock here only guards map shape and
//! short reads.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

use crate::core::model::{ChannelId, ChannelIdentity, ChannelState, Cursor};
use crate::upstream::{ChannelCatalog, ResolveError, UpstreamTransport};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to resolve channel '{identifier}': {source}")]
    Resolve {
        identifier: String,
        #[source]
        source: ResolveError,
    },

    #[error("channel {0} is not registered")]
    UnknownChannel(ChannelId),
}

#[derive(Default)]
struct Inner {
    channels: HashMap<ChannelId, ChannelState>,
    // Registration order, used by `list()`.
    order: Vec<ChannelId>,
}

#[derive(Default)]
pub struct ChannelRegistry {
    inner: RwLock<Inner>,
}

/// Turns `@Handle`, `Handle` or `https://t.me/Handle` into `handle`.
pub fn normalize_handle(identifier: &str) -> String {
    let trimmed = identifier.trim();
    let without_link = trimmed
        .strip_prefix("https://t.me/")
        .or_else(|| trimmed.strip_prefix("http://t.me/"))
        .or_else(|| trimmed.strip_prefix("t.me/"))
        .unwrap_or(trimmed);
    without_link
        .trim_start_matches('@')
        .trim_end_matches('/')
        .to_lowercase()
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `identifier` and stores the channel with its initial cursor.
    ///
    /// The cursor comes from the upstream state snapshot. If that lookup fails
    /// the channel is still registered with cursor 0.
    pub async fn register(
        &self,
        identifier: &str,
        catalog: &dyn ChannelCatalog,
        transport: &dyn UpstreamTransport,
    ) -> Result<ChannelState, RegistryError> {
        log::info!("Registering channel: {}", identifier);
        let resolved = catalog.resolve(identifier).await.map_err(|source| RegistryError::Resolve {
            identifier: identifier.to_string(),
            source,
        })?;

        if let Some(existing) = self.get(resolved.id) {
            log::warn!("Channel {} ({}) is already registered", existing.title(), existing.id());
            return Ok(existing);
        }

        let cursor = match transport.current_state().await {
            Ok(cursor) => {
                log::info!("Initialized cursor for {}: {}", resolved.title, cursor);
                cursor
            }
            Err(e) => {
                log::warn!("Could not initialize cursor for {}, using 0: {}", resolved.title, e);
                0
            }
        };

        let state = ChannelState {
            identity: Arc::new(ChannelIdentity {
                id: resolved.id,
                title: resolved.title,
                handle: normalize_handle(identifier),
                access_token: resolved.access_token,
            }),
            cursor,
        };
        self.insert(state.clone());
        log::info!("Added target channel: {} (ID: {})", state.title(), state.id());
        Ok(state)
    }

    /// Registers every identifier in order. Resolution failures are logged and
    /// skipped so one bad entry never blocks the others.
    pub async fn register_all<S: AsRef<str>>(
        &self,
        identifiers: &[S],
        catalog: &dyn ChannelCatalog,
        transport: &dyn UpstreamTransport,
    ) -> Vec<ChannelState> {
        let mut registered = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            match self.register(identifier.as_ref(), catalog, transport).await {
                Ok(state) => registered.push(state),
                Err(e) => log::error!("Skipping channel: {}", e),
            }
        }
        registered
    }

    /// Inserts a fully built state. Existing entries are left untouched.
    pub fn insert(&self, state: ChannelState) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let id = state.id();
        if inner.channels.contains_key(&id) {
            return;
        }
        inner.order.push(id);
        inner.channels.insert(id, state);
    }

    pub fn get(&self, id: ChannelId) -> Option<ChannelState> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.channels.get(&id).cloned()
    }

    /// All channels in registration order.
    pub fn list(&self) -> Vec<ChannelState> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .order
            .iter()
            .filter_map(|id| inner.channels.get(id).cloned())
            .collect()
    }

    pub fn ids(&self) -> Vec<ChannelId> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.order.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cursor(&self, id: ChannelId) -> Option<Cursor> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.channels.get(&id).map(|s| s.cursor)
    }

    /// Moves the cursor forward to `new`. A value below the current cursor is
    /// ignored, so the cursor never regresses through this path.
    ///
    /// Returns the cursor in effect afterwards.
    pub fn advance_cursor(&self, id: ChannelId, new: Cursor) -> Result<Cursor, RegistryError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let state = inner.channels.get_mut(&id).ok_or(RegistryError::UnknownChannel(id))?;
        if new < state.cursor {
            log::warn!(
                "Ignoring cursor regression for {}: {} -> {}",
                state.identity.title,
                state.cursor,
                new
            );
        } else {
            state.cursor = new;
        }
        Ok(state.cursor)
    }

    /// Replaces the cursor with the upstream baseline after a too-long answer.
    /// This is the only path allowed to move a cursor arbitrarily.
    pub fn resync_cursor(&self, id: ChannelId, baseline: Cursor) -> Result<Cursor, RegistryError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let state = inner.channels.get_mut(&id).ok_or(RegistryError::UnknownChannel(id))?;
        log::warn!(
            "Resynchronizing {} from cursor {} to baseline {}",
            state.identity.title,
            state.cursor,
            baseline
        );
        state.cursor = baseline;
        Ok(baseline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: i64, cursor: Cursor) -> ChannelState {
        ChannelState {
            identity: Arc::new(ChannelIdentity {
                id: ChannelId(id),
                title: format!("Channel {id}"),
                handle: format!("chan{id}"),
                access_token: String::new(),
            }),
            cursor,
        }
    }

    #[test]
    fn normalize_handle_strips_prefixes() {
        assert_eq!(normalize_handle("@CoinDeskGlobal"), "coindeskglobal");
        assert_eq!(normalize_handle("https://t.me/WatcherGuru"), "watcherguru");
        assert_eq!(normalize_handle("  the_block_crypto "), "the_block_crypto");
    }

    #[test]
    fn advance_never_regresses() {
        let registry = ChannelRegistry::new();
        registry.insert(state(1, 10));

        assert_eq!(registry.advance_cursor(ChannelId(1), 15).unwrap(), 15);
        assert_eq!(registry.advance_cursor(ChannelId(1), 12).unwrap(), 15);
        assert_eq!(registry.cursor(ChannelId(1)), Some(15));
    }

    #[test]
    fn resync_may_move_backwards() {
        let registry = ChannelRegistry::new();
        registry.insert(state(1, 40));

        assert_eq!(registry.resync_cursor(ChannelId(1), 7).unwrap(), 7);
        assert_eq!(registry.cursor(ChannelId(1)), Some(7));
    }

    #[test]
    fn list_keeps_registration_order_and_ignores_duplicates() {
        let registry = ChannelRegistry::new();
        registry.insert(state(3, 0));
        registry.insert(state(1, 0));
        registry.insert(state(3, 99));

        let ids: Vec<_> = registry.list().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![ChannelId(3), ChannelId(1)]);
        assert_eq!(registry.cursor(ChannelId(3)), Some(0));
    }

    #[test]
    fn unknown_channel_is_an_error() {
        let registry = ChannelRegistry::new();
        assert!(matches!(
            registry.advance_cursor(ChannelId(9), 1),
            Err(RegistryError::UnknownChannel(ChannelId(9)))
        ));
    }
}
