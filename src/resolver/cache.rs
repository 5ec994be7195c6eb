use super::expr::CompiledExpr;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

struct Slot {
    expr: Arc<CompiledExpr>,
    inserted_at: u64,
}

/// Bounded cache of compiled expressions keyed by their raw source text.
/// When full, evicts the oldest half rather than one entry at a time — a
/// single LRU eviction per insert would mean every insert past capacity
/// pays a full scan; evicting in bulk amortizes that cost across many
/// inserts at the expense of occasionally re-compiling a recently evicted
/// expression.
pub struct ExprCache {
    slots: DashMap<String, Slot>,
    capacity: usize,
    clock: AtomicU64,
    /// Serializes eviction sweeps so two concurrent inserts past capacity
    /// don't both walk and drop from the same map at once.
    eviction_lock: Mutex<()>,
}

impl ExprCache {
    pub fn new(capacity: usize) -> Self {
        ExprCache {
            slots: DashMap::new(),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            eviction_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, source: &str) -> Option<Arc<CompiledExpr>> {
        self.slots.get(source).map(|s| s.expr.clone())
    }

    pub fn insert(&self, source: String, expr: Arc<CompiledExpr>) {
        if self.slots.len() >= self.capacity {
            self.evict_half();
        }
        let inserted_at = self.clock.fetch_add(1, Ordering::Relaxed);
        self.slots.insert(source, Slot { expr, inserted_at });
    }

    fn evict_half(&self) {
        let _guard = self.eviction_lock.lock().unwrap();
        if self.slots.len() < self.capacity {
            // Another thread already evicted while we waited for the lock.
            return;
        }
        let mut entries: Vec<(String, u64)> = self
            .slots
            .iter()
            .map(|r| (r.key().clone(), r.value().inserted_at))
            .collect();
        entries.sort_unstable_by_key(|(_, t)| *t);
        for (key, _) in entries.into_iter().take(entries_to_drop(self.slots.len())) {
            self.slots.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

fn entries_to_drop(len: usize) -> usize {
    len / 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::expr::parse;

    #[test]
    fn evicts_half_when_full() {
        let cache = ExprCache::new(4);
        for i in 0..4 {
            let src = format!(r#""k{i}""#);
            cache.insert(src.clone(), Arc::new(parse(&src).unwrap()));
        }
        assert_eq!(cache.len(), 4);
        cache.insert(r#""k4""#.to_string(), Arc::new(parse(r#""k4""#).unwrap()));
        assert!(cache.len() <= 3, "half-eviction should have made room");
    }

    #[test]
    fn hits_return_same_compiled_expression() {
        let cache = ExprCache::new(10);
        let expr = Arc::new(parse(r#""a""#).unwrap());
        cache.insert("a".to_string(), expr.clone());
        assert!(cache.get("a").is_some());
        assert!(cache.get("missing").is_none());
    }
}
