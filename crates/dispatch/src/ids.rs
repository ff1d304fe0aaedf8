//! Process-wide monotonic id source

use std::sync::Mutex;

/// Monotonic id generator with a caller-supplied namespace prefix.
///
/// The counter is guarded by a mutex so concurrent callers never observe or
/// emit duplicate ids. Ids are correlation strings for logging (`task-17`,
/// `pool-2`), not globally unique identifiers.
pub struct IdGenerator {
    prefix: String,
    counter: Mutex<u64>,
}

impl IdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: Mutex::new(0),
        }
    }

    /// Next id in the sequence: `<prefix>-<n>`, starting at 1.
    pub fn generate(&self) -> String {
        let mut counter = self.counter.lock().expect("id counter lock poisoned");
        *counter += 1;
        format!("{}-{}", self.prefix, counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn ids_are_prefixed_and_monotonic() {
        let ids = IdGenerator::new("task");
        assert_eq!(ids.generate(), "task-1");
        assert_eq!(ids.generate(), "task-2");
        assert_eq!(ids.generate(), "task-3");
    }

    #[test]
    fn concurrent_callers_never_see_duplicates() {
        let ids = Arc::new(IdGenerator::new("conn"));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ids = ids.clone();
            handles.push(std::thread::spawn(move || {
                (0..250).map(|_| ids.generate()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id.clone()), "duplicate id emitted: {id}");
            }
        }
        assert_eq!(seen.len(), 8 * 250);
    }
}
