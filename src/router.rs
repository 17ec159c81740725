//! Guild-to-instance routing.
//!
//! Several service instances share one database; each guild is assigned to
//! exactly one of them by a separate fleet-management process. The router
//! caches the assignment table and answers whether the local process may
//! act on a guild's work. A guild with no assignment is owned by nobody
//! until the fleet manager places it.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::constants::ROUTER_REFRESH_SECS;
use crate::error::StoreError;
use crate::models::{GuildId, InstanceId};
use crate::store::InstanceStore;

/// Maps guilds to owning instances and gates local side effects
pub struct InstanceRouter {
    instance_id: InstanceId,
    assignments: DashMap<GuildId, InstanceId>,
    refreshed_at: Mutex<Option<DateTime<Utc>>>,
}

impl InstanceRouter {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            assignments: DashMap::new(),
            refreshed_at: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Reload the assignment table into the cache
    pub async fn refresh<S: InstanceStore + ?Sized>(&self, store: &S) -> Result<(), StoreError> {
        let assignments = store.assignments().await?;
        self.assignments.clear();
        for (guild_id, instance_id) in assignments {
            self.assignments.insert(guild_id, instance_id);
        }
        debug!(
            "Refreshed instance assignments: {} guilds known",
            self.assignments.len()
        );
        *self.refreshed_at.lock().expect("router clock lock") = Some(Utc::now());
        Ok(())
    }

    /// Refresh only when the cache is older than the refresh interval
    pub async fn refresh_if_stale<S: InstanceStore + ?Sized>(
        &self,
        store: &S,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let stale = {
            let refreshed_at = self.refreshed_at.lock().expect("router clock lock");
            refreshed_at.is_none_or(|at| now - at >= Duration::seconds(ROUTER_REFRESH_SECS))
        };
        if stale {
            self.refresh(store).await?;
        }
        Ok(())
    }

    /// Whether the local instance owns this guild's scheduled work
    pub fn owns_guild(&self, guild_id: GuildId) -> bool {
        self.assignments
            .get(&guild_id)
            .is_some_and(|owner| *owner == self.instance_id)
    }

    /// The instance a guild is assigned to, if any
    pub fn instance_for(&self, guild_id: GuildId) -> Option<InstanceId> {
        self.assignments.get(&guild_id).map(|owner| owner.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn test_ownership_follows_assignments() {
        let store = MemoryStore::new();
        let guild_a = GuildId::new(1);
        let guild_b = GuildId::new(2);
        store.assign_guild(guild_a, InstanceId::new("alpha"));
        store.assign_guild(guild_b, InstanceId::new("bravo"));

        let router = InstanceRouter::new(InstanceId::new("alpha"));
        router.refresh(&store).await.unwrap();

        assert!(router.owns_guild(guild_a));
        assert!(!router.owns_guild(guild_b));
        assert_eq!(
            router.instance_for(guild_b),
            Some(InstanceId::new("bravo"))
        );
    }

    #[tokio::test]
    async fn test_unassigned_guild_is_not_owned() {
        let store = MemoryStore::new();
        let router = InstanceRouter::new(InstanceId::new("alpha"));
        router.refresh(&store).await.unwrap();

        assert!(!router.owns_guild(GuildId::new(404)));
        assert_eq!(router.instance_for(GuildId::new(404)), None);
    }

    #[tokio::test]
    async fn test_reassignment_takes_effect_on_refresh() {
        let store = MemoryStore::new();
        let guild = GuildId::new(1);
        store.assign_guild(guild, InstanceId::new("alpha"));

        let router = InstanceRouter::new(InstanceId::new("alpha"));
        router.refresh(&store).await.unwrap();
        assert!(router.owns_guild(guild));

        store.assign_guild(guild, InstanceId::new("bravo"));
        router.refresh(&store).await.unwrap();
        assert!(!router.owns_guild(guild));
    }
}
