//! Fixed-budget arena with typed sub-pools.
//!
//! The arena accounts a single byte budget. Sub-pools are reserved against
//! it in a fixed order while the builder is alive; once built, only
//! `alloc`/`free` remain. There is no compaction and no resizing, and
//! exhaustion is a value, not a panic. Single-threaded by design.

use crate::error::Error;

/// Handle to a reserved sub-pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolId(usize);

#[derive(Debug)]
struct SubPool {
    name: &'static str,
    capacity: usize,
    // Stack of free slot indices. Preallocated to capacity; pushing a freed
    // slot can never grow it.
    free: Vec<u32>,
    in_use: usize,
}

/// Builder phase: reservations only. Consumed by [`ArenaBuilder::build`].
#[derive(Debug)]
pub struct ArenaBuilder {
    budget: usize,
    reserved: usize,
    pools: Vec<SubPool>,
}

impl ArenaBuilder {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            reserved: 0,
            pools: Vec::new(),
        }
    }

    /// Reserves `count` slots of `unit_size` bytes, charged against the
    /// budget. Over-reservation is a configuration error.
    pub fn reserve(
        &mut self,
        name: &'static str,
        count: usize,
        unit_size: usize,
    ) -> Result<PoolId, Error> {
        let bytes = count
            .checked_mul(unit_size)
            .ok_or_else(|| Error::Config(format!("{} pool size overflows", name)))?;
        if self.reserved + bytes > self.budget {
            return Err(Error::Config(format!(
                "{} pool ({} B) exceeds remaining budget ({} of {} B reserved)",
                name, bytes, self.reserved, self.budget
            )));
        }
        self.reserved += bytes;

        let mut free = Vec::with_capacity(count);
        // Reverse order so slot 0 is handed out first.
        for i in (0..count).rev() {
            free.push(i as u32);
        }
        self.pools.push(SubPool {
            name,
            capacity: count,
            free,
            in_use: 0,
        });
        Ok(PoolId(self.pools.len() - 1))
    }

    pub fn build(self) -> Arena {
        Arena { pools: self.pools }
    }
}

/// Slot accounting for all sub-pools. The typed storage for each pool lives
/// in the component that reserved it, sized to the same capacity; the arena
/// only decides which slot is live.
#[derive(Debug)]
pub struct Arena {
    pools: Vec<SubPool>,
}

impl Arena {
    /// Takes a free slot, or reports exhaustion.
    pub fn alloc(&mut self, pool: PoolId) -> Result<u32, Error> {
        let p = &mut self.pools[pool.0];
        match p.free.pop() {
            Some(slot) => {
                p.in_use += 1;
                Ok(slot)
            }
            None => Err(Error::Exhausted(p.name)),
        }
    }

    /// Returns a slot to its pool. Double-free is a logic error upstream and
    /// is not defended against beyond debug assertions.
    pub fn free(&mut self, pool: PoolId, slot: u32) {
        let p = &mut self.pools[pool.0];
        debug_assert!((slot as usize) < p.capacity);
        debug_assert!(!p.free.contains(&slot));
        p.free.push(slot);
        p.in_use -= 1;
    }

    pub fn capacity(&self, pool: PoolId) -> usize {
        self.pools[pool.0].capacity
    }

    pub fn in_use(&self, pool: PoolId) -> usize {
        self.pools[pool.0].in_use
    }

    pub fn free_slots(&self, pool: PoolId) -> usize {
        self.pools[pool.0].free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_until_exhausted() {
        let mut b = ArenaBuilder::new(1024);
        let pool = b.reserve("test", 4, 16).unwrap();
        let mut arena = b.build();

        let mut slots = Vec::new();
        for _ in 0..4 {
            slots.push(arena.alloc(pool).unwrap());
        }
        assert!(matches!(arena.alloc(pool), Err(Error::Exhausted(_))));
        assert_eq!(arena.in_use(pool), 4);

        for s in slots {
            arena.free(pool, s);
        }
        assert_eq!(arena.in_use(pool), 0);
        assert!(arena.alloc(pool).is_ok());
    }

    #[test]
    fn test_slots_are_unique() {
        let mut b = ArenaBuilder::new(1024);
        let pool = b.reserve("test", 8, 1).unwrap();
        let mut arena = b.build();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..8 {
            assert!(seen.insert(arena.alloc(pool).unwrap()));
        }
    }

    #[test]
    fn test_over_reservation_is_config_error() {
        let mut b = ArenaBuilder::new(100);
        b.reserve("a", 10, 8).unwrap();
        assert!(matches!(b.reserve("b", 10, 8), Err(Error::Config(_))));
    }

    #[test]
    fn test_pools_are_disjoint() {
        let mut b = ArenaBuilder::new(1024);
        let a = b.reserve("a", 2, 16).unwrap();
        let c = b.reserve("c", 2, 16).unwrap();
        let mut arena = b.build();
        arena.alloc(a).unwrap();
        arena.alloc(a).unwrap();
        // Exhausting one pool leaves the other untouched.
        assert!(arena.alloc(a).is_err());
        assert!(arena.alloc(c).is_ok());
    }
}
