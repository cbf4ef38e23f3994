//! Allocation registry.
//!
//! In-memory model of a global IP pool: the pool itself, the enabled flag
//! and one allocation record per cluster. The registry is persisted as a
//! flat string-keyed record; this file owns the conversion both ways.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::allocator::{block_size_for, AllocatorError};
use super::cidr::{parse_cidr, CidrError};

/// Which cross-cluster addressing feature a registry belongs to.
///
/// Both kinds share semantics; they differ in record name, field keys and
/// defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryKind {
    Globalnet,
    ClustersetIp,
}

impl RegistryKind {
    /// Name of the record holding this registry inside a namespace
    pub fn record_name(self) -> &'static str {
        match self {
            RegistryKind::Globalnet => "globalnet-info",
            RegistryKind::ClustersetIp => "clusterset-ip-info",
        }
    }

    pub fn enabled_key(self) -> &'static str {
        match self {
            RegistryKind::Globalnet => "globalnetEnabled",
            RegistryKind::ClustersetIp => "clustersetIPEnabled",
        }
    }

    pub fn pool_key(self) -> &'static str {
        match self {
            RegistryKind::Globalnet => "globalnetCidrRange",
            RegistryKind::ClustersetIp => "clustersetIPCidrRange",
        }
    }

    pub fn size_key(self) -> &'static str {
        match self {
            RegistryKind::Globalnet => "globalnetClusterSize",
            RegistryKind::ClustersetIp => "clustersetIPClusterSize",
        }
    }

    pub fn clusters_key(self) -> &'static str {
        match self {
            RegistryKind::Globalnet => "clusterinfo",
            RegistryKind::ClustersetIp => "clustersetIPClusterInfo",
        }
    }

    pub fn default_pool(self) -> &'static str {
        match self {
            RegistryKind::Globalnet => "242.0.0.0/8",
            RegistryKind::ClustersetIp => "243.0.0.0/8",
        }
    }

    pub fn default_allocation_size(self) -> u64 {
        match self {
            RegistryKind::Globalnet => 65536,
            RegistryKind::ClustersetIp => 4096,
        }
    }
}

impl std::fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryKind::Globalnet => write!(f, "Globalnet"),
            RegistryKind::ClustersetIp => write!(f, "ClustersetIP"),
        }
    }
}

/// Errors raised while building or (de)serializing a registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry record is missing field '{key}'")]
    MissingField { key: String },

    #[error("registry field '{key}' has invalid value '{value}': {reason}")]
    InvalidField { key: String, value: String, reason: String },

    #[error("invalid pool {pool}: {source}")]
    InvalidPool {
        pool: String,
        #[source]
        source: AllocatorError,
    },

    #[error(transparent)]
    Cidr(#[from] CidrError),

    #[error("failed to encode cluster allocations: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode cluster allocations: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Parent block plus the default per-cluster allocation size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    pub cidr: Ipv4Net,
    /// Address count; rounded up to a power of two when allocating
    pub allocation_size: u64,
}

impl AddressPool {
    /// Build a pool, enforcing that the default size fits twice.
    pub fn new(cidr: &str, allocation_size: u64) -> Result<Self, RegistryError> {
        let cidr = parse_cidr(cidr)?;
        block_size_for(&cidr, allocation_size).map_err(|source| RegistryError::InvalidPool {
            pool: cidr.to_string(),
            source,
        })?;
        Ok(AddressPool { cidr, allocation_size })
    }
}

/// Blocks held by a single cluster.
///
/// Exactly one CIDR per cluster today; the list leaves room for more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAllocation {
    #[serde(rename = "cluster_id")]
    pub cluster_id: String,
    #[serde(rename = "global_cidr", default)]
    pub cidrs: Vec<String>,
}

impl ClusterAllocation {
    pub fn new(cluster_id: impl Into<String>, cidr: impl Into<String>) -> Self {
        ClusterAllocation {
            cluster_id: cluster_id.into(),
            cidrs: vec![cidr.into()],
        }
    }
}

/// Full persisted state of one global IP pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRegistry {
    pub enabled: bool,
    pub pool: AddressPool,
    pub clusters: BTreeMap<String, ClusterAllocation>,
}

impl AllocationRegistry {
    pub fn new(pool: AddressPool, enabled: bool) -> Self {
        AllocationRegistry {
            enabled,
            pool,
            clusters: BTreeMap::new(),
        }
    }

    /// Default registry for a kind, enabled, with no clusters
    pub fn with_defaults(kind: RegistryKind) -> Result<Self, RegistryError> {
        let pool = AddressPool::new(kind.default_pool(), kind.default_allocation_size())?;
        Ok(Self::new(pool, true))
    }

    /// Blocks already held by `cluster_id`, if any
    pub fn cluster_cidrs(&self, cluster_id: &str) -> Option<&[String]> {
        self.clusters
            .get(cluster_id)
            .map(|c| c.cidrs.as_slice())
            .filter(|cidrs| !cidrs.is_empty())
    }

    /// Every allocated block as `(cluster_id, cidr)`, optionally skipping one cluster
    pub fn allocated_blocks(&self, excluding: Option<&str>) -> Vec<(&str, &str)> {
        self.clusters
            .values()
            .filter(|c| Some(c.cluster_id.as_str()) != excluding)
            .flat_map(|c| c.cidrs.iter().map(move |cidr| (c.cluster_id.as_str(), cidr.as_str())))
            .collect()
    }

    /// Replace the entry with a matching cluster ID, or add it.
    pub fn upsert_cluster(&mut self, allocation: ClusterAllocation) {
        self.clusters.insert(allocation.cluster_id.clone(), allocation);
    }

    /// Hydrate a registry from its flat record
    pub fn from_record(kind: RegistryKind, record: &BTreeMap<String, String>) -> Result<Self, RegistryError> {
        let enabled = match record.get(kind.enabled_key()) {
            Some(value) => parse_field::<bool>(kind.enabled_key(), value)?,
            None => false,
        };

        let pool_value = record
            .get(kind.pool_key())
            .ok_or_else(|| RegistryError::MissingField { key: kind.pool_key().to_string() })?;
        let pool_cidr = unquote(pool_value);

        let size_value = record
            .get(kind.size_key())
            .ok_or_else(|| RegistryError::MissingField { key: kind.size_key().to_string() })?;
        let allocation_size = parse_field::<u64>(kind.size_key(), size_value)?;

        let pool = AddressPool::new(&pool_cidr, allocation_size)?;
        let clusters = unmarshal_cluster_info(record.get(kind.clusters_key()).map(String::as_str))?;

        Ok(AllocationRegistry { enabled, pool, clusters })
    }

    /// Flatten into a record. Output is stable: the same registry always
    /// produces byte-identical values.
    pub fn to_record(&self, kind: RegistryKind) -> Result<BTreeMap<String, String>, RegistryError> {
        let mut record = BTreeMap::new();
        record.insert(kind.enabled_key().to_string(), self.enabled.to_string());
        record.insert(
            kind.pool_key().to_string(),
            serde_json::to_string(&self.pool.cidr.to_string()).map_err(RegistryError::Encode)?,
        );
        record.insert(kind.size_key().to_string(), self.pool.allocation_size.to_string());
        record.insert(kind.clusters_key().to_string(), marshal_cluster_info(&self.clusters)?);
        Ok(record)
    }
}

/// Serialize allocations as a tab-indented JSON array ordered by cluster ID
pub fn marshal_cluster_info(clusters: &BTreeMap<String, ClusterAllocation>) -> Result<String, RegistryError> {
    let list: Vec<&ClusterAllocation> = clusters.values().collect();
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    list.serialize(&mut ser).map_err(RegistryError::Encode)?;
    String::from_utf8(buf).map_err(|e| RegistryError::InvalidField {
        key: "cluster info".to_string(),
        value: String::new(),
        reason: e.to_string(),
    })
}

/// Parse the cluster list into a map keyed by cluster ID.
///
/// An absent or blank value is an empty registry, not an error. When an ID
/// appears twice the later entry wins.
pub fn unmarshal_cluster_info(value: Option<&str>) -> Result<BTreeMap<String, ClusterAllocation>, RegistryError> {
    let raw = match value.map(str::trim) {
        None | Some("") => return Ok(BTreeMap::new()),
        Some(raw) => raw,
    };
    let list: Vec<ClusterAllocation> = serde_json::from_str(raw).map_err(RegistryError::Decode)?;
    Ok(list.into_iter().map(|c| (c.cluster_id.clone(), c)).collect())
}

/// Add or update one cluster directly on a flat record.
///
/// Only the cluster-list field is rewritten; it is replaced as a whole.
/// Meant for callers holding the raw record rather than a parsed
/// [`AllocationRegistry`], such as tooling that patches a record by hand.
/// The join workflow parses the record, calls
/// [`AllocationRegistry::upsert_cluster`] and writes back through
/// [`AllocationRegistry::to_record`].
pub fn update_cluster_info(
    kind: RegistryKind,
    record: &mut BTreeMap<String, String>,
    allocation: ClusterAllocation,
) -> Result<(), RegistryError> {
    let mut clusters = unmarshal_cluster_info(record.get(kind.clusters_key()).map(String::as_str))?;
    clusters.insert(allocation.cluster_id.clone(), allocation);
    record.insert(kind.clusters_key().to_string(), marshal_cluster_info(&clusters)?);
    Ok(())
}

fn parse_field<T>(key: &str, value: &str) -> Result<T, RegistryError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| RegistryError::InvalidField {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

// The pool is stored JSON-quoted; accept a bare CIDR as well.
fn unquote(value: &str) -> String {
    serde_json::from_str::<String>(value).unwrap_or_else(|_| value.trim().to_string())
}
