//! Block allocation logic.
//!
//! First-fit search for a free, aligned block inside a pool. The allocator
//! keeps no state between calls: the pool and every block already handed
//! out are passed in, and the chosen block is returned. Running it twice
//! against the same inputs always yields the same block.

use ipnet::Ipv4Net;

use super::cidr::{bounds, capacity, ip_of, parse_cidr, CidrError};

/// Errors that can occur while carving a block out of a pool
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    #[error("allocation size must be greater than zero")]
    ZeroSize,

    #[error("allocation size too large: {requested} addresses exceeds half of pool {pool} ({max} addresses)")]
    SizeTooLarge {
        requested: u64,
        /// `None` when the next power of two does not fit in a u64
        rounded: Option<u64>,
        pool: String,
        max: u64,
    },

    #[error("allocation not available: no free block of {block_size} addresses left in pool {pool}")]
    Exhausted { pool: String, block_size: u64 },

    #[error(transparent)]
    Cidr(#[from] CidrError),
}

/// Round `n` up to the next power of two. `0` stays `0`; `None` when the
/// result would not fit in a u64.
pub fn next_pow2(n: u64) -> Option<u64> {
    if n == 0 {
        return Some(0);
    }
    n.checked_next_power_of_two()
}

/// Round a requested size and check it against the pool.
///
/// Returns the block size in addresses. A block may take at most half of
/// the pool, so at least two clusters can always coexist.
pub fn block_size_for(pool: &Ipv4Net, requested: u64) -> Result<u64, AllocatorError> {
    if requested == 0 {
        return Err(AllocatorError::ZeroSize);
    }
    let rounded = next_pow2(requested);
    let max = capacity(pool) / 2;
    match rounded {
        Some(size) if size <= max => Ok(size),
        _ => Err(AllocatorError::SizeTooLarge {
            requested,
            rounded,
            pool: pool.to_string(),
            max,
        }),
    }
}

/// Find the lowest free block of `size` addresses inside `pool`.
///
/// A candidate is rejected when it overlaps any allocated block, whether
/// it is contained by that block or contains it. After a rejection the
/// search resumes at the first aligned address past the conflicting
/// block, which fills gaps before appending past the highest allocation.
pub fn allocate_block(pool: &Ipv4Net, size: u64, allocated: &[Ipv4Net]) -> Result<Ipv4Net, AllocatorError> {
    let block_size = block_size_for(pool, size)?;
    let prefix = (32 - block_size.trailing_zeros()) as u8;
    let (pool_start, pool_end) = bounds(pool);

    let taken: Vec<(u64, u64)> = allocated.iter().map(bounds).collect();

    let mut start = pool_start;
    loop {
        let end = start + block_size - 1;
        if end > pool_end {
            return Err(AllocatorError::Exhausted {
                pool: pool.to_string(),
                block_size,
            });
        }

        let conflict_end = taken
            .iter()
            .filter(|(s, e)| *s <= end && start <= *e)
            .map(|(_, e)| *e)
            .max();

        match conflict_end {
            None => {
                let network = ip_of(start as u32);
                let block = Ipv4Net::new(network, prefix).map_err(|e| CidrError::Malformed {
                    cidr: format!("{}/{}", network, prefix),
                    reason: e.to_string(),
                })?;
                log::debug!("Allocated block {} from pool {}", block, pool);
                return Ok(block);
            }
            Some(e) => {
                log::debug!(
                    "Candidate {}/{} conflicts with an allocated block ending at {}",
                    ip_of(start as u32),
                    prefix,
                    ip_of(e as u32)
                );
                start = align_up(e + 1, block_size);
            }
        }
    }
}

/// String front end to [`allocate_block`].
///
/// Parses the pool and every allocated block, then returns the new block
/// in `a.b.c.d/n` notation.
///
/// ```
/// use clusterset_ipam::ip::allocate;
///
/// let next = allocate("169.254.0.0/16", 8192, &["169.254.0.0/19"])?;
/// assert_eq!(next, "169.254.32.0/19");
/// # Ok::<(), clusterset_ipam::ip::AllocatorError>(())
/// ```
pub fn allocate<S: AsRef<str>>(pool: &str, size: u64, allocated: &[S]) -> Result<String, AllocatorError> {
    let pool = parse_cidr(pool)?;
    let allocated = allocated
        .iter()
        .map(|c| parse_cidr(c.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    allocate_block(&pool, size, &allocated).map(|net| net.to_string())
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}
