/// Directory renames applied earlier in the current sync.
///
/// Entry paths are computed at reconciliation time; once an ancestor
/// directory has been renamed on a replica, descendant paths must be
/// rewritten on the fly before URIs are built. Moves are replayed in the
/// order they were recorded, so a chain of renames composes.
#[derive(Debug, Default)]
pub struct RenameTable {
    moves: Vec<(String, String)>,
}

impl RenameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, from: &str, to: &str) {
        if from != to {
            self.moves.push((from.to_string(), to.to_string()));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Rewrite a path through every recorded move that covers it.
    pub fn adjust(&self, path: &str) -> String {
        let mut current = path.to_string();
        for (from, to) in &self.moves {
            if current == *from {
                current = to.clone();
            } else if let Some(rest) = current.strip_prefix(from.as_str())
                && let Some(rest) = rest.strip_prefix('/')
            {
                current = format!("{to}/{rest}");
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjusts_descendants_of_a_renamed_directory() {
        let mut table = RenameTable::new();
        table.record("old/x", "new/x");
        assert_eq!(table.adjust("old/x/sub.txt"), "new/x/sub.txt");
        assert_eq!(table.adjust("old/x"), "new/x");
        assert_eq!(table.adjust("old/xy/sub.txt"), "old/xy/sub.txt");
        assert_eq!(table.adjust("other.txt"), "other.txt");
    }

    #[test]
    fn later_moves_compose_with_earlier_ones() {
        let mut table = RenameTable::new();
        table.record("a", "b");
        table.record("b/c", "b/d");
        assert_eq!(table.adjust("a/c/file"), "b/d/file");
    }
}
