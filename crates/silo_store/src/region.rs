//! Region and server identity: key ranges, region ids, encoded names, and
//! the transition/table state enums observable through the coord-store.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Catalog table holding the location of the meta region.
pub const ROOT_TABLE: &str = "-ROOT-";
/// Catalog table holding the locations of all user regions.
pub const META_TABLE: &str = ".META.";

/// `host:port:start_code`. The start code distinguishes process incarnations
/// on the same address; a restarted server is a different `ServerName`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerName {
    pub host: String,
    pub port: u16,
    pub start_code: u64,
}

impl ServerName {
    pub fn new(host: impl Into<String>, port: u16, start_code: u64) -> Self {
        Self {
            host: host.into(),
            port,
            start_code,
        }
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.start_code)
    }
}

impl FromStr for ServerName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, ':');
        let start_code = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing start code in server name {s:?}"))?
            .parse::<u64>()?;
        let port = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing port in server name {s:?}"))?
            .parse::<u16>()?;
        let host = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing host in server name {s:?}"))?;
        if host.is_empty() {
            anyhow::bail!("empty host in server name {s:?}");
        }
        Ok(ServerName::new(host, port, start_code))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionKind {
    Root,
    Meta,
    User,
}

/// Descriptor for one contiguous half-open key range `[start_key, end_key)`
/// of a table. An empty `end_key` means "unbounded above". The `region_id`
/// is the creation timestamp in milliseconds and never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub table: String,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub region_id: u64,
    pub kind: RegionKind,
    encoded_name: String,
}

impl RegionInfo {
    pub fn new(
        table: impl Into<String>,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        region_id: u64,
    ) -> Self {
        Self::with_kind(table, start_key, end_key, region_id, RegionKind::User)
    }

    pub fn root() -> Self {
        Self::with_kind(ROOT_TABLE, Vec::new(), Vec::new(), 0, RegionKind::Root)
    }

    pub fn meta() -> Self {
        Self::with_kind(META_TABLE, Vec::new(), Vec::new(), 1, RegionKind::Meta)
    }

    fn with_kind(
        table: impl Into<String>,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        region_id: u64,
        kind: RegionKind,
    ) -> Self {
        let table = table.into();
        let encoded_name = encode_region_name(&table, &start_key, region_id);
        Self {
            table,
            start_key,
            end_key,
            region_id,
            kind,
            encoded_name,
        }
    }

    /// Stable short name derived from `(table, start_key, region_id)`; used
    /// as the coord-store node name and the on-disk region directory name.
    pub fn encoded_name(&self) -> &str {
        &self.encoded_name
    }

    /// Human-readable full name, e.g. `users,61,1690000000000.4f2a…`.
    pub fn region_name(&self) -> String {
        format!(
            "{},{},{}.{}",
            self.table,
            hex(&self.start_key),
            self.region_id,
            self.encoded_name
        )
    }

    /// Catalog row key: sorts regions of a table by start key, then id, so a
    /// daughter (same start key, larger id) sorts after its parent.
    pub fn sort_key(&self) -> String {
        format!("{},{},{:020}", self.table, hex(&self.start_key), self.region_id)
    }

    pub fn is_system(&self) -> bool {
        !matches!(self.kind, RegionKind::User)
    }

    pub fn contains_row(&self, row: &[u8]) -> bool {
        row >= self.start_key.as_slice() && (self.end_key.is_empty() || row < self.end_key.as_slice())
    }
}

fn encode_region_name(table: &str, start_key: &[u8], region_id: u64) -> String {
    let mut hasher = DefaultHasher::new();
    table.hash(&mut hasher);
    start_key.hash(&mut hasher);
    region_id.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Region id for a split daughter. Ids are timestamps, and a daughter must
/// sort after its parent in the catalog, so a skewed clock falls back to
/// `parent + 1`.
pub fn daughter_region_id(parent_region_id: u64, now_ms: u64) -> u64 {
    if now_ms <= parent_region_id {
        tracing::warn!(
            parent_region_id,
            now_ms,
            "clock skew computing daughter region id"
        );
        parent_region_id + 1
    } else {
        now_ms
    }
}

pub fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Transition state published in a region's coord-store node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionState {
    Offline,
    Opening,
    Opened,
    Closing,
    Closed,
}

impl RegionState {
    pub fn as_byte(self) -> u8 {
        match self {
            RegionState::Offline => 0,
            RegionState::Opening => 1,
            RegionState::Opened => 2,
            RegionState::Closing => 3,
            RegionState::Closed => 4,
        }
    }

    pub fn from_byte(b: u8) -> anyhow::Result<Self> {
        Ok(match b {
            0 => RegionState::Offline,
            1 => RegionState::Opening,
            2 => RegionState::Opened,
            3 => RegionState::Closing,
            4 => RegionState::Closed,
            other => anyhow::bail!("unknown region state byte {other}"),
        })
    }
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegionState::Offline => "OFFLINE",
            RegionState::Opening => "OPENING",
            RegionState::Opened => "OPENED",
            RegionState::Closing => "CLOSING",
            RegionState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Table availability state persisted under `/table/<name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableState {
    Enabled,
    Disabled,
    Enabling,
    Disabling,
}

impl TableState {
    pub fn as_str(self) -> &'static str {
        match self {
            TableState::Enabled => "ENABLED",
            TableState::Disabled => "DISABLED",
            TableState::Enabling => "ENABLING",
            TableState::Disabling => "DISABLING",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "ENABLED" => TableState::Enabled,
            "DISABLED" => TableState::Disabled,
            "ENABLING" => TableState::Enabling,
            "DISABLING" => TableState::Disabling,
            other => anyhow::bail!("unknown table state {other:?}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_round_trips() {
        let name = ServerName::new("rs7.example", 8120, 1690000000123);
        let parsed: ServerName = name.to_string().parse().unwrap();
        assert_eq!(parsed, name);
        assert!("rs7.example:8120".parse::<ServerName>().is_err());
    }

    #[test]
    fn encoded_name_distinguishes_incarnations() {
        let a = RegionInfo::new("t", b"a".to_vec(), b"m".to_vec(), 100);
        let b = RegionInfo::new("t", b"a".to_vec(), b"m".to_vec(), 101);
        assert_ne!(a.encoded_name(), b.encoded_name());
        // Same identity inputs, same name.
        let c = RegionInfo::new("t", b"a".to_vec(), b"z".to_vec(), 100);
        assert_eq!(a.encoded_name(), c.encoded_name());
    }

    #[test]
    fn contains_row_is_half_open() {
        let r = RegionInfo::new("t", b"b".to_vec(), b"d".to_vec(), 1);
        assert!(!r.contains_row(b"a"));
        assert!(r.contains_row(b"b"));
        assert!(r.contains_row(b"c"));
        assert!(!r.contains_row(b"d"));

        let last = RegionInfo::new("t", b"d".to_vec(), Vec::new(), 1);
        assert!(last.contains_row(b"zzzz"));
    }

    #[test]
    fn daughter_id_corrects_clock_skew() {
        assert_eq!(daughter_region_id(1000, 2000), 2000);
        assert_eq!(daughter_region_id(1000, 1000), 1001);
        assert_eq!(daughter_region_id(1000, 400), 1001);
    }

    #[test]
    fn daughter_sorts_after_parent_in_catalog() {
        let parent = RegionInfo::new("t", b"a".to_vec(), Vec::new(), 1000);
        let daughter = RegionInfo::new("t", b"a".to_vec(), b"m".to_vec(), 1001);
        assert!(daughter.sort_key() > parent.sort_key());
    }

    #[test]
    fn state_bytes_round_trip() {
        for state in [
            RegionState::Offline,
            RegionState::Opening,
            RegionState::Opened,
            RegionState::Closing,
            RegionState::Closed,
        ] {
            assert_eq!(RegionState::from_byte(state.as_byte()).unwrap(), state);
        }
        assert!(RegionState::from_byte(9).is_err());
    }
}
