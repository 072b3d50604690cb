use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use parking_lot::RwLock;
use resolver::{FileMatch, RoutePattern, best_match};

/// Concrete paths remembered per pattern. Older paths are forgotten first
/// and simply resolve again.
const SEEN_CAPACITY: usize = 1024;

/// A registered pattern with the file it resolved to and the concrete
/// source paths recently seen for it.
struct RouteEntry {
    file: FileMatch,
    seen: Seen,
}

#[derive(Default)]
struct Seen {
    paths: HashSet<String>,
    order: VecDeque<String>,
}

impl Seen {
    fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    fn insert(&mut self, path: &str, capacity: usize) {
        if self.paths.contains(path) {
            return;
        }
        while self.order.len() >= capacity.max(1) {
            if let Some(oldest) = self.order.pop_front() {
                self.paths.remove(&oldest);
            }
        }
        self.paths.insert(path.to_string());
        self.order.push_back(path.to_string());
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// A route the proxy can use for one request.
#[derive(Debug, Clone)]
pub struct RouteHit {
    pub pattern: RoutePattern,
    pub params: BTreeMap<String, String>,
    pub file: FileMatch,
}

pub struct RouteTable {
    entries: RwLock<HashMap<RoutePattern, RouteEntry>>,
    capacity: usize,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::with_capacity(SEEN_CAPACITY)
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table remembering at most `capacity` concrete paths per pattern.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// The most literal registered pattern matching `path`. The match is
    /// only trusted when `path` was resolved to it before, or when `trust`
    /// is set; anything else is a miss.
    pub fn lookup(&self, path: &str, trust: bool) -> Option<RouteHit> {
        let entries = self.entries.read();
        let (pattern, params) = best_match(entries.keys(), path)?;
        let entry = entries.get(pattern)?;
        if !trust && !entry.seen.contains(path) {
            return None;
        }
        Some(RouteHit {
            pattern: pattern.clone(),
            params,
            file: entry.file.clone(),
        })
    }

    /// Records that `path` resolved to `file` under `pattern`.
    pub fn register(&self, pattern: RoutePattern, file: FileMatch, path: &str) {
        let mut entries = self.entries.write();
        let entry = entries.entry(pattern).or_insert_with(|| RouteEntry {
            file: file.clone(),
            seen: Seen::default(),
        });
        entry.file = file;
        entry.seen.insert(path, self.capacity);
    }

    /// Concrete paths remembered for `pattern`.
    pub fn seen_len(&self, pattern: &RoutePattern) -> usize {
        self.entries
            .read()
            .get(pattern)
            .map(|entry| entry.seen.len())
            .unwrap_or(0)
    }

    pub fn remove(&self, pattern: &RoutePattern) -> bool {
        self.entries.write().remove(pattern).is_some()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(match_path: &str) -> FileMatch {
        FileMatch {
            content: String::new(),
            match_path: match_path.to_string(),
            path: format!("{}.ts", match_path.trim_start_matches('/')),
            params: BTreeMap::new(),
            variables: BTreeMap::new(),
            redirect: false,
        }
    }

    fn register(table: &RouteTable, match_path: &str, seen: &str) -> RoutePattern {
        let found = file(match_path);
        let pattern = RoutePattern::from_match("local", &found, "index");
        table.register(pattern.clone(), found, seen);
        pattern
    }

    #[test]
    fn unseen_paths_miss_unless_trusted() {
        let table = RouteTable::new();
        register(&table, "/users/[id]", "/users/1");

        let hit = table.lookup("/users/1", false).expect("seen");
        assert_eq!(hit.pattern.to_string(), "/users/:id");
        assert_eq!(hit.params.get("id").map(String::as_str), Some("1"));

        assert!(table.lookup("/users/2", false).is_none());
        let hit = table.lookup("/users/2", true).expect("trusted");
        assert_eq!(hit.params.get("id").map(String::as_str), Some("2"));
    }

    #[test]
    fn prefers_the_most_literal_pattern() {
        let table = RouteTable::new();
        register(&table, "/users/[id]", "/users/me");
        let literal = register(&table, "/users/me", "/users/me");

        let hit = table.lookup("/users/me", false).expect("hit");
        assert_eq!(hit.pattern, literal);
        assert!(hit.params.is_empty());
        assert_eq!(table.len(), 2);

        assert!(table.remove(&literal));
        let hit = table.lookup("/users/me", false).expect("dynamic");
        assert_eq!(hit.pattern.to_string(), "/users/:id");
    }

    #[test]
    fn forgets_the_oldest_paths_past_capacity() {
        let table = RouteTable::with_capacity(2);
        let pattern = register(&table, "/users/[id]", "/users/1");
        for id in 2..=50 {
            let found = file("/users/[id]");
            table.register(pattern.clone(), found, &format!("/users/{}", id));
        }
        assert_eq!(table.seen_len(&pattern), 2);

        assert!(table.lookup("/users/1", false).is_none());
        assert!(table.lookup("/users/48", false).is_none());
        assert!(table.lookup("/users/49", false).is_some());
        assert!(table.lookup("/users/50", false).is_some());

        table.register(pattern.clone(), file("/users/[id]"), "/users/50");
        assert_eq!(table.seen_len(&pattern), 2);
        assert!(table.lookup("/users/49", false).is_some());
    }
}
