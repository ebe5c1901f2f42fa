//! Authoritative in-memory world state and the global version clock.
//!
//! Freshness across all users is ordered by one shared monotonic counter:
//! every accepted position update bumps it exactly once and stamps the user
//! with the new value. The counter, the broadcast watermark and the
//! persistence watermark are private to [`WorldState`] so the single-clock
//! scheme could later become per-user counters without touching callers.
//! Note the single clock means a session's cursor for one user can skip
//! ahead because another user moved; versions order freshness per user, not
//! causality between users.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use log::{debug, info, warn};
use shared::{POSITION_EPSILON, PULL_EPSILON};

use crate::store::UserRecord;

/// Mutable per-user state cached from the datastore and updated live.
#[derive(Debug, Clone)]
pub struct UserState {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub nick: String,
    /// Global clock value at the user's last accepted update.
    pub version: u64,
    /// True when the in-memory position is newer than the datastore's.
    pub dirty: bool,
    /// True while at least one connection is bound to this user.
    pub connected: bool,
    /// Last liveness response from any of the user's connections.
    pub last_activity: Option<Instant>,
}

/// What happened to a position update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Accepted; the user now carries this version.
    Applied(u64),
    /// Accepted for a user the server had never cached; entry created.
    Created(u64),
    /// All deltas under the jitter epsilon; nothing changed.
    Unchanged,
    /// Claimed version older than the stored one; dropped.
    Stale,
}

/// Snapshot of a dirty user handed to the persistence push cycle.
#[derive(Debug, Clone, Copy)]
pub struct DirtyUser {
    pub user_id: i64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub version: u64,
}

/// In-memory authoritative cache of all known users plus the clocks that
/// drive broadcasting and persistence.
#[derive(Debug, Default)]
pub struct WorldState {
    users: HashMap<i64, UserState>,
    /// The global version clock. Non-decreasing for the process lifetime.
    clock: u64,
    /// Highest clock value already handed to the broadcast scheduler.
    broadcast_floor: u64,
    /// Highest clock value known to be flushed to the datastore.
    persisted: u64,
}

/// Positions are kept at 4 decimal places; anything finer is sensor noise.
fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of the global version clock.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn user(&self, user_id: i64) -> Option<&UserState> {
        self.users.get(&user_id)
    }

    pub fn contains(&self, user_id: i64) -> bool {
        self.users.contains_key(&user_id)
    }

    /// Applies a client position update under last-writer-wins semantics.
    ///
    /// Stale claims (older than the stored version) are dropped. Updates
    /// where every coordinate moved less than the jitter epsilon are
    /// accepted as no-ops: no version bump, no dirty flag, no broadcast.
    /// Everything else bumps the global clock exactly once.
    pub fn apply_position_update(
        &mut self,
        user_id: i64,
        lat: f64,
        lon: f64,
        alt: f64,
        claimed_version: u64,
    ) -> UpdateOutcome {
        let lat = round4(lat);
        let lon = round4(lon);
        let alt = round4(alt);

        match self.users.get_mut(&user_id) {
            Some(user) => {
                if user.version > claimed_version {
                    warn!(
                        "Stale update for user {}: claimed {} < stored {}",
                        user_id, claimed_version, user.version
                    );
                    return UpdateOutcome::Stale;
                }

                let moved = (user.lat - lat).abs() > POSITION_EPSILON
                    || (user.lon - lon).abs() > POSITION_EPSILON
                    || (user.alt - alt).abs() > POSITION_EPSILON;
                if !moved {
                    debug!("Update for user {} within epsilon, ignoring", user_id);
                    return UpdateOutcome::Unchanged;
                }

                self.clock += 1;
                user.lat = lat;
                user.lon = lon;
                user.alt = alt;
                user.version = self.clock;
                user.dirty = true;
                UpdateOutcome::Applied(self.clock)
            }
            None => {
                // First sighting of this user on a live connection; cache
                // the position and let the push cycle write it through.
                self.clock += 1;
                info!("Creating user {} from live update", user_id);
                self.users.insert(
                    user_id,
                    UserState {
                        lat,
                        lon,
                        alt,
                        nick: String::new(),
                        version: self.clock,
                        dirty: true,
                        connected: true,
                        last_activity: None,
                    },
                );
                UpdateOutcome::Created(self.clock)
            }
        }
    }

    /// Installs a record loaded from the datastore on behalf of `hello`.
    /// An existing entry keeps its version; a fresh one starts at the
    /// current clock so it is not rebroadcast until it actually changes.
    pub fn insert_loaded(&mut self, record: &UserRecord) {
        let version = self
            .users
            .get(&record.id)
            .map(|u| u.version)
            .unwrap_or(self.clock);
        let entry = self.users.entry(record.id).or_insert_with(|| UserState {
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            nick: String::new(),
            version,
            dirty: false,
            connected: false,
            last_activity: None,
        });
        entry.lat = record.lat;
        entry.lon = record.lon;
        entry.alt = record.alt;
        entry.nick = record.nick.clone();
        entry.dirty = false;
    }

    /// Merges a periodic datastore pull into local state.
    ///
    /// Users without a live connection are overwritten outright (the store
    /// is authoritative for them); connected users only absorb changes
    /// larger than the pull epsilon, so collaborator write paths win over
    /// drift but not over live updates. Stored versions never decrease.
    pub fn merge_pulled(&mut self, records: &[UserRecord], connected: &HashSet<i64>) {
        for record in records {
            let is_connected = connected.contains(&record.id);
            match self.users.get_mut(&record.id) {
                None => {
                    self.users.insert(
                        record.id,
                        UserState {
                            lat: record.lat,
                            lon: record.lon,
                            alt: record.alt,
                            nick: record.nick.clone(),
                            version: self.broadcast_floor,
                            dirty: false,
                            connected: is_connected,
                            last_activity: None,
                        },
                    );
                }
                Some(user) if !is_connected => {
                    user.lat = record.lat;
                    user.lon = record.lon;
                    user.alt = record.alt;
                    user.nick = record.nick.clone();
                    user.dirty = false;
                    user.connected = false;
                }
                Some(user) => {
                    let drift = (user.lat - record.lat).abs() > PULL_EPSILON
                        || (user.lon - record.lon).abs() > PULL_EPSILON
                        || (user.alt - record.alt).abs() > PULL_EPSILON;
                    // A dirty user holds a newer position than the store;
                    // leave it for the push cycle instead of clobbering it.
                    if drift && !user.dirty {
                        info!("User {} updated from datastore", record.id);
                        user.lat = record.lat;
                        user.lon = record.lon;
                        user.alt = record.alt;
                    }
                    user.nick = record.nick.clone();
                    user.connected = true;
                }
            }
        }
    }

    /// True when at least one accepted update has not been broadcast yet.
    pub fn needs_broadcast(&self) -> bool {
        self.clock > self.broadcast_floor
    }

    /// Marks everything up to the current clock as broadcast.
    pub fn finish_broadcast(&mut self) {
        self.broadcast_floor = self.clock;
    }

    /// True when at least one accepted update has not been persisted yet.
    pub fn needs_push(&self) -> bool {
        self.clock > self.persisted
    }

    /// Snapshot of every user awaiting a datastore flush.
    pub fn dirty_snapshot(&self) -> Vec<DirtyUser> {
        self.users
            .iter()
            .filter(|(_, user)| user.dirty)
            .map(|(id, user)| DirtyUser {
                user_id: *id,
                lat: user.lat,
                lon: user.lon,
                alt: user.alt,
                version: user.version,
            })
            .collect()
    }

    /// Acknowledges a completed datastore write. The dirty flag only clears
    /// when the user has not moved again since the snapshot was taken.
    pub fn mark_persisted(&mut self, user_id: i64, version: u64) {
        if let Some(user) = self.users.get_mut(&user_id) {
            if user.version <= version {
                user.dirty = false;
            }
        }
        self.persisted = self.persisted.max(version);
    }

    pub fn set_connected(&mut self, user_id: i64, connected: bool) {
        if let Some(user) = self.users.get_mut(&user_id) {
            user.connected = connected;
        }
    }

    /// Records liveness for the user behind a `pong`.
    pub fn touch(&mut self, user_id: i64) {
        if let Some(user) = self.users.get_mut(&user_id) {
            user.last_activity = Some(Instant::now());
        }
    }

    /// Iterates all cached users for the broadcast scheduler.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &UserState)> {
        self.users.iter().map(|(id, user)| (*id, user))
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn record(id: i64, lat: f64, lon: f64, alt: f64) -> UserRecord {
        UserRecord {
            id,
            lat,
            lon,
            alt,
            nick: format!("user{id}"),
        }
    }

    fn seeded_world() -> WorldState {
        let mut world = WorldState::new();
        world.insert_loaded(&record(1, 10.0, 20.0, 1.0));
        world
    }

    #[test]
    fn test_clock_increments_once_per_accepted_update() {
        let mut world = seeded_world();
        assert_eq!(world.clock(), 0);

        let outcome = world.apply_position_update(1, 11.0, 20.0, 1.0, world.clock());
        assert_eq!(outcome, UpdateOutcome::Applied(1));
        assert_eq!(world.clock(), 1);

        let outcome = world.apply_position_update(1, 12.0, 20.0, 1.0, world.clock());
        assert_eq!(outcome, UpdateOutcome::Applied(2));
        assert_eq!(world.clock(), 2);
        assert_eq!(world.user(1).unwrap().version, 2);
    }

    #[test]
    fn test_epsilon_update_is_noop() {
        let mut world = seeded_world();
        // Deltas of 0.00004 round away entirely at 4 decimal places.
        let outcome = world.apply_position_update(1, 10.00004, 20.00004, 1.00004, 0);
        assert_eq!(outcome, UpdateOutcome::Unchanged);
        assert_eq!(world.clock(), 0);
        assert!(!world.user(1).unwrap().dirty);
    }

    #[test]
    fn test_stale_update_dropped() {
        let mut world = seeded_world();
        world.apply_position_update(1, 11.0, 20.0, 1.0, 0);
        assert_eq!(world.user(1).unwrap().version, 1);

        // Claim an older clock value than the stored version.
        let outcome = world.apply_position_update(1, 50.0, 50.0, 50.0, 0);
        assert_eq!(outcome, UpdateOutcome::Stale);
        assert_approx_eq!(world.user(1).unwrap().lat, 11.0);
        assert_eq!(world.clock(), 1);
    }

    #[test]
    fn test_accepted_update_marks_dirty_and_rounds() {
        let mut world = seeded_world();
        world.apply_position_update(1, 11.123456, 20.0, 1.0, 0);
        let user = world.user(1).unwrap();
        assert!(user.dirty);
        assert_approx_eq!(user.lat, 11.1235);
    }

    #[test]
    fn test_unknown_user_created_dirty() {
        let mut world = WorldState::new();
        let outcome = world.apply_position_update(9, 1.0, 2.0, 3.0, 0);
        assert_eq!(outcome, UpdateOutcome::Created(1));
        let user = world.user(9).unwrap();
        assert!(user.dirty);
        assert!(user.connected);
    }

    #[test]
    fn test_insert_loaded_preserves_version() {
        let mut world = seeded_world();
        world.apply_position_update(1, 11.0, 20.0, 1.0, 0);
        world.insert_loaded(&record(1, 99.0, 99.0, 9.0));
        let user = world.user(1).unwrap();
        assert_eq!(user.version, 1);
        assert!(!user.dirty);
        assert_approx_eq!(user.lat, 99.0);
    }

    #[test]
    fn test_merge_overwrites_disconnected_users() {
        let mut world = seeded_world();
        world.apply_position_update(1, 11.0, 20.0, 1.0, 0);
        let before = world.user(1).unwrap().version;

        world.merge_pulled(&[record(1, 30.0, 40.0, 2.0)], &HashSet::new());
        let user = world.user(1).unwrap();
        assert_approx_eq!(user.lat, 30.0);
        assert!(!user.dirty);
        assert!(!user.connected);
        // Versions never go backwards, even on overwrite.
        assert_eq!(user.version, before);
    }

    #[test]
    fn test_merge_respects_live_dirty_state() {
        let mut world = seeded_world();
        world.apply_position_update(1, 11.0, 20.0, 1.0, 0);

        let connected: HashSet<i64> = [1].into_iter().collect();
        world.merge_pulled(&[record(1, 30.0, 40.0, 2.0)], &connected);
        // The live (dirty) position wins over the pulled one.
        assert_approx_eq!(world.user(1).unwrap().lat, 11.0);
        assert!(world.user(1).unwrap().dirty);
    }

    #[test]
    fn test_merge_absorbs_collaborator_writes_for_clean_users() {
        let mut world = seeded_world();
        let connected: HashSet<i64> = [1].into_iter().collect();
        world.merge_pulled(&[record(1, 30.0, 40.0, 2.0)], &connected);
        assert_approx_eq!(world.user(1).unwrap().lat, 30.0);
    }

    #[test]
    fn test_merge_ignores_sub_epsilon_drift_for_connected() {
        let mut world = seeded_world();
        let connected: HashSet<i64> = [1].into_iter().collect();
        world.merge_pulled(&[record(1, 10.0005, 20.0, 1.0)], &connected);
        assert_approx_eq!(world.user(1).unwrap().lat, 10.0);
    }

    #[test]
    fn test_merge_inserts_new_users_at_broadcast_floor() {
        let mut world = seeded_world();
        world.apply_position_update(1, 11.0, 20.0, 1.0, 0);
        world.finish_broadcast();

        world.merge_pulled(&[record(2, 5.0, 6.0, 0.0)], &HashSet::new());
        assert_eq!(world.user(2).unwrap().version, 1);
        // Nothing new to broadcast: the pulled user sits at the floor.
        assert!(!world.needs_broadcast());
    }

    #[test]
    fn test_broadcast_watermark() {
        let mut world = seeded_world();
        assert!(!world.needs_broadcast());
        world.apply_position_update(1, 11.0, 20.0, 1.0, 0);
        assert!(world.needs_broadcast());
        world.finish_broadcast();
        assert!(!world.needs_broadcast());
    }

    #[test]
    fn test_dirty_snapshot_and_persist_ack() {
        let mut world = seeded_world();
        world.apply_position_update(1, 11.0, 20.0, 1.0, 0);
        assert!(world.needs_push());

        let dirty = world.dirty_snapshot();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].user_id, 1);
        assert_eq!(dirty[0].version, 1);

        world.mark_persisted(1, 1);
        assert!(!world.user(1).unwrap().dirty);
        assert!(!world.needs_push());
        assert!(world.dirty_snapshot().is_empty());
    }

    #[test]
    fn test_persist_ack_keeps_dirty_after_newer_update() {
        let mut world = seeded_world();
        world.apply_position_update(1, 11.0, 20.0, 1.0, 0);
        let snapshot = world.dirty_snapshot()[0];

        // The user moves again before the write completes.
        world.apply_position_update(1, 12.0, 20.0, 1.0, world.clock());

        world.mark_persisted(snapshot.user_id, snapshot.version);
        assert!(world.user(1).unwrap().dirty);
        assert!(world.needs_push());
    }
}
