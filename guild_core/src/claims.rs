//! Global spatial index of claimed chunks.
//!
//! The index and each guild's claim set are updated together before any call
//! returns, so no caller ever observes one without the other.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::config::CLAIM_SLOTS_UPGRADE;
use crate::error::{ClaimError, GuildError};
use crate::model::{ChunkCoord, ClaimKey, Guild, GuildId};
use crate::registry::GuildRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimChange {
    pub key: ClaimKey,
    pub previous: Option<GuildId>,
    pub current: Option<GuildId>,
}

/// Notified on the tick thread after every committed claim change.
pub trait ClaimObserver: Send {
    fn claim_changed(&self, change: &ClaimChange);
}

pub struct ClaimManager {
    index: HashMap<ClaimKey, GuildId>,
    require_contiguous: bool,
    observers: Vec<Box<dyn ClaimObserver>>,
}

impl ClaimManager {
    pub fn new(require_contiguous: bool) -> Self {
        Self {
            index: HashMap::new(),
            require_contiguous,
            observers: Vec::new(),
        }
    }

    pub fn from_registry(registry: &GuildRegistry) -> Self {
        let mut manager = ClaimManager::new(registry.config().claims().require_contiguous());
        for guild in registry.iter() {
            for key in guild.claims.keys() {
                if let Some(previous) = manager.index.insert(key.clone(), guild.id) {
                    tracing::warn!(
                        target: "guilds::claims",
                        key = %key,
                        guild = %guild.id,
                        previous = %previous,
                        "index.conflicting_claim"
                    );
                }
            }
        }
        tracing::info!(target: "guilds::claims", claims = manager.index.len(), "index.built");
        manager
    }

    pub fn add_observer(&mut self, observer: Box<dyn ClaimObserver>) {
        self.observers.push(observer);
    }

    pub fn owner_at(&self, key: &ClaimKey) -> Option<GuildId> {
        self.index.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn claim_limit(registry: &GuildRegistry, guild: &Guild) -> usize {
        registry
            .config()
            .claim_limit(guild.level, guild.upgrade_level(CLAIM_SLOTS_UPGRADE))
    }

    pub fn try_claim(
        &mut self,
        registry: &mut GuildRegistry,
        guild_id: GuildId,
        key: ClaimKey,
        now: u64,
    ) -> Result<(), GuildError> {
        let guild = registry.ensure_writable(guild_id)?;

        // Occupancy wins over the limit, including the guild's own claims.
        if let Some(owner) = self.owner_at(&key) {
            return Err(ClaimError::AlreadyClaimed { key, owner }.into());
        }

        let limit = ClaimManager::claim_limit(registry, guild);
        if guild.claims.len() >= limit {
            return Err(ClaimError::LimitExceeded {
                guild: guild_id,
                limit,
            }
            .into());
        }

        if self.require_contiguous {
            let detached = {
                let mut in_world = guild.claims_in_world(&key.world).peekable();
                in_world.peek().is_some() && !in_world.any(|owned| owned.is_adjacent(&key))
            };
            if detached {
                return Err(ClaimError::NotContiguous(key).into());
            }
        }

        registry.attach_claim(guild_id, key.clone(), now)?;
        self.index.insert(key.clone(), guild_id);
        tracing::debug!(target: "guilds::claims", guild = %guild_id, key = %key, "claim.added");
        self.notify(ClaimChange {
            key,
            previous: None,
            current: Some(guild_id),
        });
        Ok(())
    }

    pub fn unclaim(&mut self, registry: &mut GuildRegistry, guild_id: GuildId, key: &ClaimKey) -> Result<(), GuildError> {
        let guild = registry.ensure_writable(guild_id)?;
        match self.owner_at(key) {
            None => return Err(ClaimError::NotClaimed(key.clone()).into()),
            Some(owner) if owner != guild_id => {
                return Err(ClaimError::NotOwner {
                    key: key.clone(),
                    guild: guild_id,
                    owner,
                }
                .into())
            }
            Some(_) => {}
        }

        if self.require_contiguous && would_break_contiguity(guild, key) {
            return Err(ClaimError::WouldBreakContiguity(key.clone()).into());
        }

        registry.detach_claim(guild_id, key)?;
        self.index.remove(key);
        tracing::debug!(target: "guilds::claims", guild = %guild_id, key = %key, "claim.removed");
        self.notify(ClaimChange {
            key: key.clone(),
            previous: Some(guild_id),
            current: None,
        });
        Ok(())
    }

    /// Drops every index entry of a disbanded guild.
    pub fn release_all(&mut self, guild: &Guild) -> usize {
        let mut released = 0;
        for key in guild.claims.keys() {
            if self.index.get(key) == Some(&guild.id) {
                self.index.remove(key);
                released += 1;
                self.notify(ClaimChange {
                    key: key.clone(),
                    previous: Some(guild.id),
                    current: None,
                });
            }
        }
        tracing::info!(target: "guilds::claims", guild = %guild.id, released, "claims.released");
        released
    }

    fn notify(&self, change: ClaimChange) {
        for observer in &self.observers {
            observer.claim_changed(&change);
        }
    }
}

/// The home claim stays while anything else is held, and the remaining
/// claims of the world must stay edge-connected.
fn would_break_contiguity(guild: &Guild, key: &ClaimKey) -> bool {
    if guild.claims.len() > 1 && guild.home_claim() == Some(key) {
        return true;
    }

    let remaining: HashSet<ChunkCoord> = guild
        .claims_in_world(&key.world)
        .filter(|owned| *owned != key)
        .map(|owned| owned.coord)
        .collect();
    let Some(start) = remaining.iter().next().copied() else {
        return false;
    };

    let mut seen = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(coord) = queue.pop_front() {
        for next in coord.neighbours() {
            if remaining.contains(&next) && seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    seen.len() != remaining.len()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;

    use super::*;
    use crate::config::GuildConfig;
    use crate::model::PlayerId;

    fn setup(json: &str) -> (GuildRegistry, ClaimManager) {
        let config = Arc::new(GuildConfig::from_json_str(json).expect("config"));
        let registry = GuildRegistry::new(config, GuildId(1));
        let manager = ClaimManager::from_registry(&registry);
        (registry, manager)
    }

    fn guild(registry: &mut GuildRegistry, name: &str) -> (GuildId, PlayerId) {
        let owner = PlayerId::random();
        (registry.create_guild(name, owner, 1).expect("create"), owner)
    }

    #[test]
    fn limit_then_occupancy_scenario() {
        let (mut registry, mut claims) = setup("{}");
        let (a, _) = guild(&mut registry, "alpha");
        let (b, _) = guild(&mut registry, "bravo");

        for x in 0..10 {
            claims.try_claim(&mut registry, a, ClaimKey::new("world1", x, 0), 1).expect("within limit");
        }
        let err = claims
            .try_claim(&mut registry, a, ClaimKey::new("world1", 5, 5), 2)
            .expect_err("limit");
        assert!(matches!(err, GuildError::Claim(ClaimError::LimitExceeded { limit: 10, .. })));

        claims.try_claim(&mut registry, b, ClaimKey::new("world1", 5, 5), 3).expect("b claims");
        let err = claims
            .try_claim(&mut registry, a, ClaimKey::new("world1", 5, 5), 4)
            .expect_err("occupied");
        assert!(matches!(err, GuildError::Claim(ClaimError::AlreadyClaimed { owner, .. }) if owner == b));
    }

    #[test]
    fn reclaiming_own_chunk_is_rejected() {
        let (mut registry, mut claims) = setup("{}");
        let (a, _) = guild(&mut registry, "alpha");
        let key = ClaimKey::new("world", 0, 0);
        claims.try_claim(&mut registry, a, key.clone(), 1).expect("claim");
        let err = claims.try_claim(&mut registry, a, key.clone(), 2).expect_err("idempotent claim");
        assert!(matches!(err, GuildError::Claim(ClaimError::AlreadyClaimed { .. })));
        assert_eq!(registry.get(a).expect("guild").claims.len(), 1);
    }

    #[test]
    fn claim_slot_upgrade_raises_the_limit() {
        let (mut registry, mut claims) = setup(r#"{ "tiers": [ { "level": 1, "exp_required": 0, "max_claims": 1, "member_limit": 5 } ] }"#);
        let (a, owner) = guild(&mut registry, "alpha");
        claims.try_claim(&mut registry, a, ClaimKey::new("world", 0, 0), 1).expect("first");
        assert!(claims.try_claim(&mut registry, a, ClaimKey::new("world", 1, 0), 1).is_err());

        registry.set_upgrade(owner, a, CLAIM_SLOTS_UPGRADE, 1).expect("upgrade");
        claims.try_claim(&mut registry, a, ClaimKey::new("world", 1, 0), 2).expect("second");
        claims.try_claim(&mut registry, a, ClaimKey::new("world", 2, 0), 2).expect("third");
    }

    #[test]
    fn contiguous_policy_guards_claims_and_unclaims() {
        let (mut registry, mut claims) = setup(r#"{ "claims": { "require_contiguous": true } }"#);
        let (a, _) = guild(&mut registry, "alpha");
        claims.try_claim(&mut registry, a, ClaimKey::new("world", 0, 0), 1).expect("home");
        claims.try_claim(&mut registry, a, ClaimKey::new("world", 1, 0), 2).expect("east");
        claims.try_claim(&mut registry, a, ClaimKey::new("world", 2, 0), 3).expect("further east");
        claims.try_claim(&mut registry, a, ClaimKey::new("nether", 9, 9), 4).expect("first in world");

        let err = claims
            .try_claim(&mut registry, a, ClaimKey::new("world", 5, 5), 5)
            .expect_err("detached");
        assert!(matches!(err, GuildError::Claim(ClaimError::NotContiguous(_))));

        let err = claims
            .unclaim(&mut registry, a, &ClaimKey::new("world", 1, 0))
            .expect_err("splits territory");
        assert!(matches!(err, GuildError::Claim(ClaimError::WouldBreakContiguity(_))));
        let err = claims
            .unclaim(&mut registry, a, &ClaimKey::new("world", 0, 0))
            .expect_err("home claim");
        assert!(matches!(err, GuildError::Claim(ClaimError::WouldBreakContiguity(_))));

        claims.unclaim(&mut registry, a, &ClaimKey::new("world", 2, 0)).expect("edge chunk");
        assert_eq!(claims.owner_at(&ClaimKey::new("world", 2, 0)), None);
    }

    #[test]
    fn contiguity_at_the_coordinate_border() {
        let (mut registry, mut claims) = setup(r#"{ "claims": { "require_contiguous": true } }"#);
        let (a, _) = guild(&mut registry, "alpha");
        claims.try_claim(&mut registry, a, ClaimKey::new("world", i32::MAX, 0), 1).expect("east edge");

        let err = claims
            .try_claim(&mut registry, a, ClaimKey::new("world", i32::MIN, 0), 2)
            .expect_err("no wrap-around");
        assert!(matches!(err, GuildError::Claim(ClaimError::NotContiguous(_))));

        claims.try_claim(&mut registry, a, ClaimKey::new("world", i32::MAX - 1, 0), 3).expect("inward");
        claims.try_claim(&mut registry, a, ClaimKey::new("world", i32::MAX - 2, 0), 4).expect("inward again");
        let err = claims
            .unclaim(&mut registry, a, &ClaimKey::new("world", i32::MAX - 1, 0))
            .expect_err("splits the strip");
        assert!(matches!(err, GuildError::Claim(ClaimError::WouldBreakContiguity(_))));
        claims
            .unclaim(&mut registry, a, &ClaimKey::new("world", i32::MAX - 2, 0))
            .expect("inner end");
    }

    #[test]
    fn unclaim_checks_ownership() {
        let (mut registry, mut claims) = setup("{}");
        let (a, _) = guild(&mut registry, "alpha");
        let (b, _) = guild(&mut registry, "bravo");
        let key = ClaimKey::new("world", 3, 3);
        assert!(matches!(
            claims.unclaim(&mut registry, a, &key),
            Err(GuildError::Claim(ClaimError::NotClaimed(_)))
        ));
        claims.try_claim(&mut registry, b, key.clone(), 1).expect("claim");
        assert!(matches!(
            claims.unclaim(&mut registry, a, &key),
            Err(GuildError::Claim(ClaimError::NotOwner { .. }))
        ));
    }

    struct Recorder(Arc<Mutex<Vec<ClaimChange>>>);

    impl ClaimObserver for Recorder {
        fn claim_changed(&self, change: &ClaimChange) {
            self.0.lock().expect("recorder lock").push(change.clone());
        }
    }

    #[test]
    fn observers_see_claims_and_releases() {
        let (mut registry, mut claims) = setup("{}");
        let seen = Arc::new(Mutex::new(Vec::new()));
        claims.add_observer(Box::new(Recorder(Arc::clone(&seen))));
        let (a, owner) = guild(&mut registry, "alpha");
        let key = ClaimKey::new("world", 0, 0);
        claims.try_claim(&mut registry, a, key.clone(), 1).expect("claim");

        let retired = registry.disband(owner, a).expect("disband");
        assert_eq!(claims.release_all(&retired.guild), 1);
        assert_eq!(claims.owner_at(&key), None);

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].previous, Some(a));
        assert_eq!(seen[1].current, None);
    }

    proptest! {
        #[test]
        fn exactly_one_contender_wins_a_chunk(contenders in 2usize..12, order in proptest::collection::vec(any::<u8>(), 12)) {
            let (mut registry, mut claims) = setup("{}");
            let mut ids: Vec<GuildId> = (0..contenders)
                .map(|n| guild(&mut registry, &format!("guild{n}")).0)
                .collect();
            // Arrival order within the tick is arbitrary.
            ids.sort_by_key(|id| order[id.0 as usize % order.len()]);

            let key = ClaimKey::new("world", 7, -3);
            let mut winners = Vec::new();
            for id in &ids {
                match claims.try_claim(&mut registry, *id, key.clone(), 1) {
                    Ok(()) => winners.push(*id),
                    Err(GuildError::Claim(ClaimError::AlreadyClaimed { owner, .. })) => {
                        prop_assert_eq!(Some(owner), winners.first().copied());
                    }
                    Err(other) => prop_assert!(false, "unexpected error {other}"),
                }
            }
            prop_assert_eq!(winners.len(), 1);
            prop_assert_eq!(claims.owner_at(&key), Some(winners[0]));
        }

        #[test]
        fn index_matches_guild_claim_sets(ops in proptest::collection::vec((0usize..3, -3i32..3, -3i32..3, any::<bool>()), 1..60)) {
            let (mut registry, mut claims) = setup("{}");
            let ids: Vec<GuildId> = (0..3).map(|n| guild(&mut registry, &format!("guild{n}")).0).collect();
            for (who, x, z, claim) in ops {
                let key = ClaimKey::new("world", x, z);
                let _ = if claim {
                    claims.try_claim(&mut registry, ids[who], key, 1)
                } else {
                    claims.unclaim(&mut registry, ids[who], &key)
                };
            }

            let mut from_guilds = 0;
            for id in &ids {
                let guild = registry.get(*id).expect("guild");
                prop_assert!(guild.claims.len() <= ClaimManager::claim_limit(&registry, guild));
                for key in guild.claims.keys() {
                    prop_assert_eq!(claims.owner_at(key), Some(*id));
                    from_guilds += 1;
                }
            }
            prop_assert_eq!(from_guilds, claims.len());
        }
    }
}
