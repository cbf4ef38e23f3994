//! IP address pool management.
//!
//! CIDR arithmetic, first-fit block allocation, and the registry model
//! recording which cluster holds which block.

pub mod allocator;
pub mod cidr;
pub mod registry;

// Re-export commonly used types
pub use allocator::{allocate, allocate_block, AllocatorError};
pub use cidr::{address_of, ip_of, is_valid_pool, overlaps, CidrError};
pub use registry::{AddressPool, AllocationRegistry, ClusterAllocation, RegistryError, RegistryKind};
