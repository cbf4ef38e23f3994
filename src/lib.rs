//! # Clusterset IPAM - Global IP pool allocation for multi-cluster fabrics
//!
//! This library hands out disjoint IPv4 blocks from a shared parent range to
//! the clusters of a multi-cluster mesh, so every joining cluster gets a
//! globally unique subnet for cross-cluster addressing.
//!
//! ## Overview
//!
//! Each cluster either receives an automatically allocated block or has a
//! requested block validated against every existing allocation. The
//! allocations live in one shared, versioned record; clusters joining at the
//! same time race through optimistic concurrency and the losers recompute.
//!
//! ## Architecture
//!
//! - `ip::cidr`: CIDR parsing, validity, containment and overlap checks
//! - `ip::allocator`: stateless first-fit block allocation
//! - `ip::registry`: pool + per-cluster allocations and their flat record form
//! - `store`: versioned record stores and the registry adapter
//! - `orchestrator`: the per-join read, allocate, conditional-write loop
//! - `config` / `config_loader`: YAML configuration for the CLI
//!
//! ## Example Usage
//!
//! ```rust
//! use clusterset_ipam::ip::{AddressPool, AllocationRegistry, RegistryKind};
//! use clusterset_ipam::orchestrator::{JoinRequest, Orchestrator};
//! use clusterset_ipam::store::{InMemoryStore, RegistryStore};
//!
//! let store = InMemoryStore::new();
//! let registry = AllocationRegistry::new(AddressPool::new("242.0.0.0/8", 65536)?, true);
//! RegistryStore::new(&store, RegistryKind::Globalnet).ensure_created("broker", &registry)?;
//!
//! let orchestrator = Orchestrator::new(&store, RegistryKind::Globalnet);
//! let outcome = orchestrator.allocate_cidr("broker", &JoinRequest::new("east"))?;
//! assert_eq!(outcome.cidr.as_deref(), Some("242.0.0.0/16"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Error Handling
//!
//! Library modules return typed `thiserror` enums carrying the offending
//! CIDR, pool and cluster. The binary reports them through `color_eyre`.

pub mod config;
pub mod config_loader;
pub mod ip;
pub mod orchestrator;
pub mod store;
