use std::sync::Arc;

use crate::config::EngineConfig;
use crate::keys::{OwnerToken, ReservationKey};
use crate::model::{OwnedBooking, ReservationTree};
use crate::session::Session;
use crate::store::{ReservationStore, Scope, StoreError};

use super::watch::Watch;
use super::{bounded, OwnershipError};

/// Every record in `tree` whose stored owner equals `owner`, in
/// date/slot/table order.
///
/// Both sides are sanitized tokens. The raw identity is never rebuilt from a
/// token for matching.
pub fn collect_owned(tree: &ReservationTree, owner: &OwnerToken) -> Vec<OwnedBooking> {
    let mut owned = Vec::new();
    for (date, slots) in tree {
        for (slot, tables) in slots {
            for (table, record) in tables {
                if record.booked_by == *owner {
                    owned.push(OwnedBooking {
                        key: ReservationKey::from_parts(*date, slot, table),
                        record: record.clone(),
                        display_owner: record.booked_by.display_identity(),
                    });
                }
            }
        }
    }
    owned
}

/// Answers "which bookings are mine" by scanning the whole tree. There is no
/// owner index, so each call costs O(total reservations).
#[derive(Clone)]
pub struct OwnershipResolver {
    store: Arc<dyn ReservationStore>,
    config: Arc<EngineConfig>,
}

impl OwnershipResolver {
    pub fn new(store: Arc<dyn ReservationStore>, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    pub async fn find_bookings_for(
        &self,
        session: &Session,
    ) -> Result<Vec<OwnedBooking>, OwnershipError> {
        let owner = session.owner_token().ok_or(OwnershipError::NotAuthenticated)?;
        Ok(load(&self.store, &self.config, &owner).await?)
    }

    /// Deliver the caller's bookings now and again after every change
    /// anywhere in the tree.
    pub async fn subscribe<F>(
        &self,
        session: &Session,
        mut on_update: F,
    ) -> Result<Watch, OwnershipError>
    where
        F: FnMut(Vec<OwnedBooking>) + Send + 'static,
    {
        let owner = session.owner_token().ok_or(OwnershipError::NotAuthenticated)?;
        let feed = self.store.subscribe(&Scope::All)?;
        on_update(load(&self.store, &self.config, &owner).await?);

        let store = self.store.clone();
        let config = self.config.clone();
        Ok(Watch::spawn(
            feed,
            move || {
                let store = store.clone();
                let config = config.clone();
                let owner = owner.clone();
                async move { load(&store, &config, &owner).await }
            },
            on_update,
        ))
    }
}

async fn load(
    store: &Arc<dyn ReservationStore>,
    config: &EngineConfig,
    owner: &OwnerToken,
) -> Result<Vec<OwnedBooking>, StoreError> {
    let tree = bounded(config.store_timeout, "scan", store.snapshot(&Scope::All)).await?;
    Ok(collect_owned(&tree, owner))
}
