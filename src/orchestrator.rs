//! Allocation orchestrator.
//!
//! Runs one cluster join against a shared registry: read a snapshot,
//! decide the cluster's block, and persist it with a conditional update.
//! A version conflict restarts the whole cycle from a fresh read, because
//! another cluster may have taken the block just computed.

use ipnet::Ipv4Net;

use crate::ip::allocator::{allocate_block, next_pow2, AllocatorError};
use crate::ip::cidr::{capacity, is_subnet_of, is_valid_pool, overlaps, parse_cidr, CidrError};
use crate::ip::registry::{AllocationRegistry, ClusterAllocation, RegistryKind};
use crate::store::{RecordStore, RegistryStore, StoreError};

/// Conventional number of attempts for conflict retries
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Bound on read-compute-write attempts.
///
/// Attempts run back to back: a conflict is reported synchronously by the
/// store, so there is nothing to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// One cluster asking for a block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinRequest {
    /// Opaque key; only used for lookup
    pub cluster_id: String,
    /// Explicit block. Takes precedence over `requested_size`.
    pub requested_cidr: Option<String>,
    /// Address count; `0` means the pool default
    pub requested_size: u64,
}

impl JoinRequest {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        JoinRequest {
            cluster_id: cluster_id.into(),
            ..Default::default()
        }
    }

    pub fn with_cidr(mut self, cidr: impl Into<String>) -> Self {
        let cidr = cidr.into();
        self.requested_cidr = if cidr.trim().is_empty() { None } else { Some(cidr) };
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.requested_size = size;
        self
    }
}

/// Result of a join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationOutcome {
    /// Allocated or confirmed block; `None` when the feature is disabled
    pub cidr: Option<String>,
    pub enabled: bool,
    /// The block was already stored before this join
    pub preconfigured: bool,
    /// Set when a stored block won over a different request
    pub warning: Option<String>,
}

/// Errors surfaced to the join workflow
#[derive(Debug, thiserror::Error)]
pub enum AllocateError {
    #[error("invalid CIDR {cidr} requested for cluster {cluster_id}: {source}")]
    InvalidCidr {
        cluster_id: String,
        cidr: String,
        #[source]
        source: CidrError,
    },

    #[error("requested CIDR {cidr} for cluster {cluster_id} is not part of pool {pool}")]
    OutsidePool {
        cluster_id: String,
        cidr: String,
        pool: String,
    },

    #[error("requested CIDR {cidr} for cluster {cluster_id} overlaps with cluster {other_cluster}'s CIDR {other_cidr}")]
    Overlap {
        cluster_id: String,
        cidr: String,
        other_cluster: String,
        other_cidr: String,
    },

    #[error("failed to allocate a CIDR for cluster {cluster_id} from pool {pool}: {source}")]
    Allocation {
        cluster_id: String,
        pool: String,
        #[source]
        source: AllocatorError,
    },

    #[error("cluster {owner} has an unusable stored CIDR {cidr}: {source}")]
    CorruptAllocation {
        owner: String,
        cidr: String,
        #[source]
        source: CidrError,
    },

    #[error("{kind} registry not found in namespace {namespace}; the feature must be enabled on the broker first")]
    RegistryMissing { kind: RegistryKind, namespace: String },

    #[error("registry store error in namespace {namespace}: {source}")]
    Store {
        namespace: String,
        #[source]
        source: StoreError,
    },

    #[error("gave up allocating a CIDR for cluster {cluster_id} after {attempts} conflicting attempts")]
    RetriesExhausted { cluster_id: String, attempts: u32 },
}

impl AllocateError {
    /// Only exhausted conflict retries are worth re-invoking the whole join for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AllocateError::RetriesExhausted { .. })
    }
}

enum Attempt {
    Done(AllocationOutcome),
    Conflict,
}

/// Per-join workflow over a registry store
#[derive(Debug, Clone)]
pub struct Orchestrator<S> {
    registry: RegistryStore<S>,
    retry: RetryPolicy,
}

impl<S: RecordStore> Orchestrator<S> {
    pub fn new(store: S, kind: RegistryKind) -> Self {
        Orchestrator {
            registry: RegistryStore::new(store, kind),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry_store(&self) -> &RegistryStore<S> {
        &self.registry
    }

    /// Allocate or confirm the block for `request.cluster_id`.
    pub fn allocate_cidr(&self, namespace: &str, request: &JoinRequest) -> Result<AllocationOutcome, AllocateError> {
        let max_attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.attempt(namespace, request)? {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Conflict => {
                    log::debug!(
                        "Registry conflict while allocating for cluster {} (attempt {}/{}), retrying",
                        request.cluster_id,
                        attempt,
                        max_attempts
                    );
                }
            }
        }

        log::warn!(
            "Giving up on cluster {} after {} conflicting attempts",
            request.cluster_id,
            max_attempts
        );
        Err(AllocateError::RetriesExhausted {
            cluster_id: request.cluster_id.clone(),
            attempts: max_attempts,
        })
    }

    fn attempt(&self, namespace: &str, request: &JoinRequest) -> Result<Attempt, AllocateError> {
        let kind = self.registry.kind();
        let (mut registry, version) = self.registry.get(namespace).map_err(|source| {
            if source.is_not_found() {
                AllocateError::RegistryMissing {
                    kind,
                    namespace: namespace.to_string(),
                }
            } else {
                AllocateError::Store {
                    namespace: namespace.to_string(),
                    source,
                }
            }
        })?;

        if !registry.enabled {
            log::info!("{} is disabled in namespace {}", kind, namespace);
            return Ok(Attempt::Done(AllocationOutcome {
                cidr: None,
                enabled: false,
                preconfigured: false,
                warning: None,
            }));
        }

        if let Some(existing) = registry.cluster_cidrs(&request.cluster_id) {
            return Ok(Attempt::Done(preconfigured_outcome(kind, request, existing)));
        }

        let candidate = match &request.requested_cidr {
            Some(cidr) => {
                if request.requested_size != 0 {
                    log::debug!(
                        "Both CIDR {} and size {} requested for cluster {}; using the CIDR",
                        cidr,
                        request.requested_size,
                        request.cluster_id
                    );
                }
                validate_requested(&registry, &request.cluster_id, cidr)?
            }
            None => {
                let size = if request.requested_size == 0 {
                    registry.pool.allocation_size
                } else {
                    request.requested_size
                };
                allocate_from_pool(&registry, &request.cluster_id, size)?
            }
        };

        let cidr = candidate.to_string();
        registry.upsert_cluster(ClusterAllocation::new(request.cluster_id.clone(), cidr.clone()));

        match self.registry.conditional_update(namespace, &registry, version) {
            Ok(_) => {
                log::info!("Allocated {} CIDR {} to cluster {}", kind, cidr, request.cluster_id);
                Ok(Attempt::Done(AllocationOutcome {
                    cidr: Some(cidr),
                    enabled: true,
                    preconfigured: false,
                    warning: None,
                }))
            }
            Err(e) if e.is_conflict() => Ok(Attempt::Conflict),
            Err(source) => Err(AllocateError::Store {
                namespace: namespace.to_string(),
                source,
            }),
        }
    }
}

/// One-shot join with the default retry policy
pub fn allocate_cidr<S: RecordStore>(
    store: S,
    kind: RegistryKind,
    namespace: &str,
    request: &JoinRequest,
) -> Result<AllocationOutcome, AllocateError> {
    Orchestrator::new(store, kind).allocate_cidr(namespace, request)
}

fn preconfigured_outcome(kind: RegistryKind, request: &JoinRequest, existing: &[String]) -> AllocationOutcome {
    let current = existing[0].clone();
    let warning = conflicting_request(request, &current).map(|requested| {
        format!(
            "Cluster {} already has {} CIDR {} allocated; ignoring requested {}",
            request.cluster_id, kind, current, requested
        )
    });

    match &warning {
        Some(message) => log::warn!("{}", message),
        None => log::info!(
            "Cluster {} already has {} CIDR {} allocated",
            request.cluster_id,
            kind,
            current
        ),
    }

    AllocationOutcome {
        cidr: Some(current),
        enabled: true,
        preconfigured: true,
        warning,
    }
}

// Describes what the caller asked for when it differs from the stored block.
fn conflicting_request(request: &JoinRequest, current: &str) -> Option<String> {
    let stored = parse_cidr(current).ok();

    if let Some(requested) = &request.requested_cidr {
        let same = match (parse_cidr(requested), stored) {
            (Ok(requested), Some(stored)) => requested == stored,
            _ => requested.trim() == current,
        };
        return if same { None } else { Some(format!("CIDR {}", requested)) };
    }

    if request.requested_size != 0 {
        let rounded = next_pow2(request.requested_size);
        if rounded.is_none() || stored.map(|net| capacity(&net)) != rounded {
            return Some(format!("size {}", request.requested_size));
        }
    }
    None
}

fn validate_requested(registry: &AllocationRegistry, cluster_id: &str, cidr: &str) -> Result<Ipv4Net, AllocateError> {
    let candidate = is_valid_pool(cidr).map_err(|source| AllocateError::InvalidCidr {
        cluster_id: cluster_id.to_string(),
        cidr: cidr.to_string(),
        source,
    })?;
    let normalized = candidate.to_string();

    if !is_subnet_of(&candidate, &registry.pool.cidr) {
        return Err(AllocateError::OutsidePool {
            cluster_id: cluster_id.to_string(),
            cidr: normalized,
            pool: registry.pool.cidr.to_string(),
        });
    }

    for (owner, block) in registry.allocated_blocks(Some(cluster_id)) {
        let overlapping = overlaps(&[block], &normalized).map_err(|source| AllocateError::CorruptAllocation {
            owner: owner.to_string(),
            cidr: block.to_string(),
            source,
        })?;
        if overlapping {
            return Err(AllocateError::Overlap {
                cluster_id: cluster_id.to_string(),
                cidr: normalized,
                other_cluster: owner.to_string(),
                other_cidr: block.to_string(),
            });
        }
    }

    Ok(candidate)
}

fn allocate_from_pool(registry: &AllocationRegistry, cluster_id: &str, size: u64) -> Result<Ipv4Net, AllocateError> {
    let allocated = registry
        .allocated_blocks(None)
        .into_iter()
        .map(|(owner, block)| {
            parse_cidr(block).map_err(|source| AllocateError::CorruptAllocation {
                owner: owner.to_string(),
                cidr: block.to_string(),
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    allocate_block(&registry.pool.cidr, size, &allocated).map_err(|source| AllocateError::Allocation {
        cluster_id: cluster_id.to_string(),
        pool: registry.pool.cidr.to_string(),
        source,
    })
}
