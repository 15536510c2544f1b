use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for a guild. Allocated monotonically and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GuildId(pub u64);

impl fmt::Display for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a player as handed to us by the host server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PlayerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(PlayerId)
    }
}

/// Chunk coordinate inside a world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i32,
    pub z: i32,
}

impl ChunkCoord {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Edge-sharing neighbours. Chunks on the i32 border have fewer than four.
    pub fn neighbours(&self) -> impl Iterator<Item = ChunkCoord> {
        let (x, z) = (self.x, self.z);
        [
            x.checked_add(1).map(|x| ChunkCoord::new(x, z)),
            x.checked_sub(1).map(|x| ChunkCoord::new(x, z)),
            z.checked_add(1).map(|z| ChunkCoord::new(x, z)),
            z.checked_sub(1).map(|z| ChunkCoord::new(x, z)),
        ]
        .into_iter()
        .flatten()
    }

    pub fn is_adjacent(&self, other: &ChunkCoord) -> bool {
        (self.x.abs_diff(other.x) == 1 && self.z == other.z)
            || (self.z.abs_diff(other.z) == 1 && self.x == other.x)
    }
}

/// One claimable spatial unit: a chunk in a named world.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClaimKey {
    pub world: String,
    pub coord: ChunkCoord,
}

impl ClaimKey {
    pub fn new(world: impl Into<String>, x: i32, z: i32) -> Self {
        Self {
            world: world.into(),
            coord: ChunkCoord::new(x, z),
        }
    }

    pub fn is_adjacent(&self, other: &ClaimKey) -> bool {
        self.world == other.world && self.coord.is_adjacent(&other.coord)
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({},{})", self.world, self.coord.x, self.coord.z)
    }
}

bitflags! {
    /// Closed set of actions a rank may be allowed to perform.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Permissions: u32 {
        const CLAIM = 1 << 0;
        const UNCLAIM = 1 << 1;
        const INVITE = 1 << 2;
        const KICK = 1 << 3;
        const DEPOSIT = 1 << 4;
        const WITHDRAW = 1 << 5;
        const MANAGE_RANKS = 1 << 6;
        const MANAGE_UPGRADES = 1 << 7;
        const RENAME = 1 << 8;
        const TOGGLE_PVP = 1 << 9;
        const DISBAND = 1 << 10;
        const SET_HOME = 1 << 11;
    }
}

/// A rank definition. Higher ordinals take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rank {
    pub name: String,
    pub ordinal: u16,
    pub permissions: Permissions,
}

impl Rank {
    pub fn allows(&self, permission: Permissions) -> bool {
        self.permissions.contains(permission)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub player: PlayerId,
    pub rank: u16,
    pub joined_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub key: ClaimKey,
    pub guild: GuildId,
    pub claimed_at: u64,
}

/// Append-only bank movement. Positive deltas are deposits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub guild: GuildId,
    pub delta: i64,
    pub reason: String,
    pub actor: Option<PlayerId>,
    pub at: u64,
}

/// Named teleport point. Positions are block-space, not chunk-space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildHome {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f32,
    pub pitch: f32,
}

impl GuildHome {
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
            yaw: 0.0,
            pitch: 0.0,
        }
    }

    pub fn facing(mut self, yaw: f32, pitch: f32) -> Self {
        self.yaw = yaw;
        self.pitch = pitch;
        self
    }
}

/// Scalar columns of the `guilds` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildRow {
    pub id: GuildId,
    pub name: String,
    pub owner: PlayerId,
    pub created_at: u64,
    pub balance: i64,
    pub level: u32,
    pub exp: u64,
    pub pvp_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct Guild {
    pub id: GuildId,
    pub name: String,
    pub owner: PlayerId,
    /// Sorted by ordinal, highest first.
    pub ranks: Vec<Rank>,
    pub members: HashMap<PlayerId, Member>,
    pub balance: i64,
    pub claims: BTreeMap<ClaimKey, u64>,
    pub upgrades: BTreeMap<String, u32>,
    pub invites: BTreeMap<PlayerId, u64>,
    /// Keyed by lowercased name.
    pub homes: BTreeMap<String, GuildHome>,
    pub level: u32,
    pub exp: u64,
    pub pvp_enabled: bool,
    pub created_at: u64,
    /// Set on every mutation, cleared once a flush covering it has completed.
    pub dirty: bool,
    /// Quarantined after a store corruption error; mutations are refused.
    pub read_only: bool,
}

impl Guild {
    pub fn from_row(row: GuildRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            owner: row.owner,
            ranks: Vec::new(),
            members: HashMap::new(),
            balance: row.balance,
            claims: BTreeMap::new(),
            upgrades: BTreeMap::new(),
            invites: BTreeMap::new(),
            homes: BTreeMap::new(),
            level: row.level,
            exp: row.exp,
            pvp_enabled: row.pvp_enabled,
            created_at: row.created_at,
            dirty: false,
            read_only: false,
        }
    }

    pub fn row(&self) -> GuildRow {
        GuildRow {
            id: self.id,
            name: self.name.clone(),
            owner: self.owner,
            created_at: self.created_at,
            balance: self.balance,
            level: self.level,
            exp: self.exp,
            pvp_enabled: self.pvp_enabled,
        }
    }

    pub fn is_member(&self, player: PlayerId) -> bool {
        self.members.contains_key(&player)
    }

    pub fn member(&self, player: PlayerId) -> Option<&Member> {
        self.members.get(&player)
    }

    pub fn rank(&self, ordinal: u16) -> Option<&Rank> {
        self.ranks.iter().find(|rank| rank.ordinal == ordinal)
    }

    pub fn rank_of(&self, player: PlayerId) -> Option<&Rank> {
        self.member(player).and_then(|member| self.rank(member.rank))
    }

    pub fn top_rank(&self) -> Option<&Rank> {
        self.ranks.first()
    }

    pub fn lowest_rank(&self) -> Option<&Rank> {
        self.ranks.last()
    }

    /// The owner is always allowed; everyone else goes through their rank.
    pub fn has_permission(&self, player: PlayerId, permission: Permissions) -> bool {
        if player == self.owner {
            return true;
        }
        self.rank_of(player)
            .map(|rank| rank.allows(permission))
            .unwrap_or(false)
    }

    pub fn upgrade_level(&self, name: &str) -> u32 {
        self.upgrades.get(name).copied().unwrap_or(0)
    }

    pub fn home(&self, name: &str) -> Option<&GuildHome> {
        self.homes.get(&name.to_lowercase())
    }

    /// Earliest claim; ties break on key order.
    pub fn home_claim(&self) -> Option<&ClaimKey> {
        self.claims
            .iter()
            .min_by(|(a_key, a_at), (b_key, b_at)| a_at.cmp(b_at).then_with(|| a_key.cmp(b_key)))
            .map(|(key, _)| key)
    }

    pub fn claims_in_world<'a>(&'a self, world: &'a str) -> impl Iterator<Item = &'a ClaimKey> + 'a {
        self.claims.keys().filter(move |key| key.world == world)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacency_is_edge_only() {
        let origin = ClaimKey::new("world", 0, 0);
        assert!(origin.is_adjacent(&ClaimKey::new("world", 1, 0)));
        assert!(origin.is_adjacent(&ClaimKey::new("world", 0, -1)));
        assert!(!origin.is_adjacent(&ClaimKey::new("world", 1, 1)));
        assert!(!origin.is_adjacent(&ClaimKey::new("nether", 1, 0)));
        assert!(!origin.is_adjacent(&origin));
    }

    #[test]
    fn border_chunks_do_not_wrap() {
        let east = ChunkCoord::new(i32::MAX, 0);
        let west = ChunkCoord::new(i32::MIN, 0);
        assert!(!east.is_adjacent(&west));
        assert!(!west.is_adjacent(&east));
        assert!(east.is_adjacent(&ChunkCoord::new(i32::MAX - 1, 0)));

        let corner = ChunkCoord::new(i32::MIN, i32::MAX);
        let around: Vec<ChunkCoord> = corner.neighbours().collect();
        assert_eq!(
            around,
            vec![ChunkCoord::new(i32::MIN + 1, i32::MAX), ChunkCoord::new(i32::MIN, i32::MAX - 1)]
        );
        assert_eq!(ChunkCoord::new(0, 0).neighbours().count(), 4);
    }

    #[test]
    fn permissions_parse_from_config_text() {
        let parsed: Permissions = serde_json::from_str("\"CLAIM | INVITE\"").expect("parse flags");
        assert_eq!(parsed, Permissions::CLAIM | Permissions::INVITE);
    }

    #[test]
    fn home_claim_is_earliest() {
        let mut claims = BTreeMap::new();
        claims.insert(ClaimKey::new("world", 5, 5), 10);
        claims.insert(ClaimKey::new("world", 0, 0), 20);
        claims.insert(ClaimKey::new("world", 9, 9), 10);
        let mut guild = Guild::from_row(GuildRow {
            id: GuildId(1),
            name: "a".into(),
            owner: PlayerId::random(),
            created_at: 0,
            balance: 0,
            level: 1,
            exp: 0,
            pvp_enabled: false,
        });
        guild.claims = claims;
        assert_eq!(guild.home_claim(), Some(&ClaimKey::new("world", 5, 5)));
    }
}
