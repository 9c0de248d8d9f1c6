//! Clubs: federation of the per-host pools belonging to one replica set.
//!
//! A club shares a minimum-connection budget across its member pools so that
//! traffic against one node of a replica set keeps connections warm on its
//! siblings. Member pools hold the club id; the club holds only the member
//! host set, so removal paths detach both sides under the root lock.

use std::collections::HashSet;
use std::sync::Arc;

use crate::host::HostAndPort;
use crate::options::WarmingPolicy;
use crate::pool::{PoolInner, PoolShared};

pub(crate) type ClubId = u64;

/// Shared controller state for one replica set (or one standalone host).
pub(crate) struct PoolClub {
    /// Replica-set name; `None` for the solitary club of a standalone host
    pub(crate) set_name: Option<String>,
    /// Effective minimum connection count for every member
    pub(crate) min_conns: usize,
    /// Floor the effective minimum never drops below
    pub(crate) default_min_conns: usize,
    /// Believed primary of the set, if announced
    pub(crate) primary: Option<HostAndPort>,
    /// Member pools, by host key
    pub(crate) members: HashSet<HostAndPort>,
}

impl PoolClub {
    pub(crate) fn solitary(default_min_conns: usize) -> Self {
        Self {
            set_name: None,
            min_conns: default_min_conns,
            default_min_conns,
            primary: None,
            members: HashSet::new(),
        }
    }

    pub(crate) fn named(set_name: impl Into<String>, default_min_conns: usize) -> Self {
        Self {
            set_name: Some(set_name.into()),
            ..Self::solitary(default_min_conns)
        }
    }
}

impl PoolInner {
    /// Obtain-or-create the club for a replica set name.
    pub(crate) fn club_for_set(&mut self, shared: &Arc<PoolShared>, set_name: &str) -> ClubId {
        if let Some(id) = self.clubs_by_set.get(set_name) {
            return *id;
        }
        let id = self.alloc_club_id();
        self.clubs.insert(
            id,
            PoolClub::named(set_name, shared.tunables.min_connections()),
        );
        self.clubs_by_set.insert(set_name.to_string(), id);
        id
    }

    /// Create a fresh solitary club.
    pub(crate) fn make_solitary_club(&mut self, shared: &Arc<PoolShared>) -> ClubId {
        let id = self.alloc_club_id();
        self.clubs
            .insert(id, PoolClub::solitary(shared.tunables.min_connections()));
        id
    }

    /// Move a pool into `club`, detaching it from its previous club. An
    /// anonymous club left without members is garbage-collected.
    pub(crate) fn attach_pool_to_club(&mut self, host: &HostAndPort, club: ClubId) {
        let Some(pool) = self.pools.get_mut(host) else {
            return;
        };
        let previous = pool.club;
        pool.club = club;

        if previous != club {
            let mut drop_previous = false;
            if let Some(old) = self.clubs.get_mut(&previous) {
                old.members.remove(host);
                drop_previous = old.set_name.is_none() && old.members.is_empty();
            }
            if drop_previous {
                self.clubs.remove(&previous);
            }
        }

        if let Some(new_club) = self.clubs.get_mut(&club) {
            new_club.members.insert(host.clone());
        }
    }

    /// Detach a pool into a club of its own, reverting its budget to the
    /// configured default.
    pub(crate) fn detach_pool_to_solitary(&mut self, shared: &Arc<PoolShared>, host: &HostAndPort) {
        if !self.pools.contains_key(host) {
            return;
        }
        let club = self.make_solitary_club(shared);
        self.attach_pool_to_club(host, club);
    }

    /// Recompute the club budget after activity on `host`.
    pub(crate) fn update_controller(&mut self, shared: &Arc<PoolShared>, host: &HostAndPort) {
        let Some(pool) = self.pools.get(host) else {
            return;
        };
        let club_id = pool.club;
        let Some(club) = self.clubs.get(&club_id) else {
            return;
        };

        match shared.warming_policy {
            WarmingPolicy::MaxOverSiblings => {
                let mut min_conns = club.default_min_conns;
                for member in &club.members {
                    if let Some(member_pool) = self.pools.get(member) {
                        min_conns = min_conns.max(member_pool.in_use_connections());
                    }
                }
                if let Some(club) = self.clubs.get_mut(&club_id) {
                    club.min_conns = min_conns;
                }
            }
            WarmingPolicy::PrimaryOnly => {
                if club.primary.as_ref() == Some(host) {
                    let in_use = pool.in_use_connections();
                    let default = club.default_min_conns;
                    if let Some(club) = self.clubs.get_mut(&club_id) {
                        club.min_conns = default.max(in_use);
                    }
                }
            }
        }
    }
}
