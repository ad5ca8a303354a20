use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Directed graph over table names with an edge from `a` to `b` whenever
/// `a` carries a foreign key referencing `b`.
///
/// Adjacency is kept in ordered maps so that breadth-first expansion
/// visits neighbors in a fixed order, which keeps path selection stable
/// across runs.
#[derive(Debug, Default, Clone)]
pub struct RelationshipGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl RelationshipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: impl Into<String>) {
        self.edges.entry(node.into()).or_default();
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) {
        let to = to.into();
        self.add_node(to.clone());
        self.edges.entry(from.into()).or_default().insert(to);
    }

    pub fn contains(&self, node: &str) -> bool {
        self.edges.contains_key(node)
    }

    /// Shortest directed path from `from` to `to`, endpoints included.
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        if !self.contains(from) || !self.contains(to) {
            return None;
        }
        if from == to {
            return Some(vec![from.to_string()]);
        }
        let mut prev: HashMap<&str, &str> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(from);
        while let Some(current) = queue.pop_front() {
            for next in self.edges.get(current).into_iter().flatten() {
                let next = next.as_str();
                if next == from || prev.contains_key(next) {
                    continue;
                }
                prev.insert(next, current);
                if next == to {
                    let mut path = vec![to.to_string()];
                    let mut cursor = to;
                    while let Some(p) = prev.get(cursor) {
                        path.push((*p).to_string());
                        cursor = p;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> RelationshipGraph {
        let mut g = RelationshipGraph::new();
        g.add_edge("avatars", "users");
        g.add_edge("posts", "users");
        g.add_edge("comments", "posts");
        g
    }

    #[test]
    fn direct_edge() {
        assert_eq!(
            graph().shortest_path("avatars", "users"),
            Some(vec!["avatars".to_string(), "users".to_string()])
        );
    }

    #[test]
    fn transitive_path() {
        assert_eq!(
            graph().shortest_path("comments", "users"),
            Some(vec![
                "comments".to_string(),
                "posts".to_string(),
                "users".to_string()
            ])
        );
    }

    #[test]
    fn edges_are_directed() {
        assert_eq!(graph().shortest_path("users", "avatars"), None);
    }

    #[test]
    fn unknown_node() {
        assert_eq!(graph().shortest_path("users", "nothing"), None);
    }

    #[test]
    fn trivial_path() {
        assert_eq!(
            graph().shortest_path("users", "users"),
            Some(vec!["users".to_string()])
        );
    }

    #[test]
    fn picks_the_same_path_every_time() {
        let mut g = RelationshipGraph::new();
        g.add_edge("root", "a");
        g.add_edge("root", "b");
        g.add_edge("a", "leaf");
        g.add_edge("b", "leaf");
        for _ in 0..16 {
            assert_eq!(
                g.shortest_path("root", "leaf"),
                Some(vec![
                    "root".to_string(),
                    "a".to_string(),
                    "leaf".to_string()
                ])
            );
        }
    }
}
