use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::task::{AbortHandle, JoinHandle};

/// Lock a std mutex, recovering the guard if a holder panicked. None of the
/// locks in this crate are held across suspension points, so the protected
/// state is always consistent when the guard is reacquired.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Allocates small integer ids starting at 1, leaving 0 free as a nil value.
/// Destroyed ids are recycled; a contiguous run of destroyed ids at the top
/// lowers the watermark instead.
#[derive(Debug)]
pub struct IdPool {
    next_id: u32,
    recycle: HashSet<u32>,
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}

impl IdPool {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            recycle: HashSet::new(),
        }
    }

    pub fn create(&mut self) -> u32 {
        if let Some(&id) = self.recycle.iter().next() {
            self.recycle.remove(&id);
            id
        } else {
            let id = self.next_id;
            self.next_id += 1;
            id
        }
    }

    pub fn destroy(&mut self, id: u32) {
        self.recycle.insert(id);
        while self.recycle.remove(&(self.next_id - 1)) {
            self.next_id -= 1;
        }
    }
}

/// An [`IdPool`] coupled with the id-to-entity map. Lookup is O(1);
/// iteration order is unspecified.
#[derive(Debug)]
pub struct IdRegistry<T> {
    ids: IdPool,
    items: HashMap<u32, T>,
}

impl<T> Default for IdRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IdRegistry<T> {
    pub fn new() -> Self {
        Self {
            ids: IdPool::new(),
            items: HashMap::new(),
        }
    }

    /// Allocate an id and store the entity the builder makes from it.
    pub fn insert_with(&mut self, build: impl FnOnce(u32) -> T) -> &T {
        let id = self.ids.create();
        self.items.entry(id).or_insert_with(|| build(id))
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.items.get(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        let item = self.items.remove(&id);
        if item.is_some() {
            self.ids.destroy(id);
        }
        item
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Owns a set of spawned tasks and aborts whatever is still running when the
/// group is cancelled or dropped. Every long-lived background task in the
/// server belongs to exactly one group, so disconnects, protocol swaps and
/// unit destruction cancel exactly their dependents.
#[derive(Debug, Default)]
pub struct TaskGroup {
    tasks: Vec<JoinHandle<()>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&mut self, future: impl Future<Output = ()> + Send + 'static) -> AbortHandle {
        self.tasks.retain(|task| !task.is_finished());
        let task = tokio::spawn(future);
        let abort = task.abort_handle();
        self.tasks.push(task);
        abort
    }

    pub fn cancel_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_pool_starts_at_one_and_recycles() {
        let mut pool = IdPool::new();
        assert_eq!(pool.create(), 1);
        assert_eq!(pool.create(), 2);
        assert_eq!(pool.create(), 3);
        pool.destroy(2);
        assert_eq!(pool.create(), 2);
    }

    #[test]
    fn id_pool_lowers_watermark_on_contiguous_top_frees() {
        let mut pool = IdPool::new();
        for _ in 0..4 {
            pool.create();
        }
        pool.destroy(4);
        pool.destroy(3);
        // 3 and 4 were the top of the range, so they are handed out fresh
        // again instead of sitting in the recycle set.
        assert_eq!(pool.create(), 3);
        assert_eq!(pool.create(), 4);
        assert_eq!(pool.create(), 5);
    }

    #[test]
    fn registry_round_trip() {
        let mut registry: IdRegistry<String> = IdRegistry::new();
        let id = {
            let name = registry.insert_with(|id| format!("entity-{id}"));
            assert_eq!(name, "entity-1");
            1
        };
        assert_eq!(registry.get(id).map(String::as_str), Some("entity-1"));
        assert_eq!(registry.remove(id), Some("entity-1".to_string()));
        assert!(registry.get(id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn task_group_aborts_on_drop() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        {
            let mut group = TaskGroup::new();
            group.spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                flag.store(true, Ordering::SeqCst);
            });
        }
        tokio::task::yield_now().await;
        assert!(!finished.load(Ordering::SeqCst));
    }
}
