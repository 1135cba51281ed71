//! Deferred-delete view over the prekey store.
//!
//! Establishing a session from a prekey message consumes a prekey, but the
//! consumption must only become durable once the session itself has been
//! saved. The view hides staged prekeys from its own lookups while leaving
//! the store untouched until [`DeferredPreKeyView::commit`].

use crate::crypto::{PreKey, MAX_PREKEY_ID};
use crate::session::PreKeyLookup;
use crate::store::CryptoboxStore;
use crate::utils::{Result, StoreError};
use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, warn};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Prekey lookup that defers deletions until commit
pub struct DeferredPreKeyView<S: ?Sized> {
    store: Arc<S>,
    pending: BTreeSet<u16>,
}

impl<S: CryptoboxStore + ?Sized> DeferredPreKeyView<S> {
    /// Create a view with nothing staged
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            pending: BTreeSet::new(),
        }
    }

    /// Load a prekey, hiding prekeys staged through this view
    pub async fn lookup(&self, prekey_id: u16) -> Result<Option<PreKey>> {
        if self.pending.contains(&prekey_id) {
            debug!("Prekey {} is staged for deletion", prekey_id);
            return Ok(None);
        }
        Ok(self.store.load_prekey(prekey_id).await?)
    }

    /// Stage a prekey for deletion. The last-resort prekey is never staged.
    pub fn stage_delete(&mut self, prekey_id: u16) {
        if prekey_id == MAX_PREKEY_ID {
            debug!("Keeping last-resort prekey");
            return;
        }
        if self.pending.insert(prekey_id) {
            debug!("Staged prekey {} for deletion", prekey_id);
        }
    }

    /// Ids currently staged for deletion
    pub fn staged(&self) -> impl Iterator<Item = u16> + '_ {
        self.pending.iter().copied()
    }

    /// True if nothing is staged
    pub fn is_clean(&self) -> bool {
        self.pending.is_empty()
    }

    /// Durably delete every staged prekey.
    ///
    /// Deletions are issued concurrently. Ids that were deleted leave the
    /// staged set; ids that failed stay staged so a later commit retries them.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PreKeyCommit` listing every id whose deletion
    /// failed.
    pub async fn commit(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let ids: Vec<u16> = self.pending.iter().copied().collect();
        let store = &self.store;
        let results = join_all(ids.iter().map(|&id| async move {
            (id, store.delete_prekey(id).await)
        }))
        .await;

        let mut failed = Vec::new();
        for (id, result) in results {
            match result {
                Ok(()) => {
                    self.pending.remove(&id);
                }
                Err(e) => failed.push((id, e.to_string())),
            }
        }

        if failed.is_empty() {
            debug!("Deleted {} consumed prekey(s)", ids.len());
            Ok(())
        } else {
            warn!(
                "Failed to delete {} of {} consumed prekey(s)",
                failed.len(),
                ids.len()
            );
            Err(StoreError::PreKeyCommit { failed }.into())
        }
    }
}

#[async_trait]
impl<S: CryptoboxStore + ?Sized> PreKeyLookup for DeferredPreKeyView<S> {
    async fn lookup(&self, prekey_id: u16) -> Result<Option<PreKey>> {
        DeferredPreKeyView::lookup(self, prekey_id).await
    }

    async fn stage_delete(&mut self, prekey_id: u16) -> Result<()> {
        DeferredPreKeyView::stage_delete(self, prekey_id);
        Ok(())
    }
}
