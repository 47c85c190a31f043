/// Hands out target ids from two disjoint ranges: even ids for query
/// targets allocated by the target cache, odd ids for limbo resolution
/// targets allocated by the sync engine. Keeping the ranges apart lets
/// either side allocate without coordination.
#[derive(Debug)]
pub struct TargetIdGenerator {
    last_id: i32,
}

impl TargetIdGenerator {
    /// Generator for query targets: 2, 4, 6, ...
    pub fn for_target_cache() -> Self {
        Self { last_id: 0 }
    }

    /// Generator for limbo resolution targets: 1, 3, 5, ...
    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    pub fn next(&mut self) -> i32 {
        self.last_id += 2;
        self.last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_and_limbo_ranges_never_collide() {
        let mut queries = TargetIdGenerator::for_target_cache();
        let mut limbo = TargetIdGenerator::for_sync_engine();
        assert_eq!(queries.next(), 2);
        assert_eq!(queries.next(), 4);
        assert_eq!(limbo.next(), 1);
        assert_eq!(limbo.next(), 3);
    }
}
