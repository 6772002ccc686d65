//! Master-side index from label to the connections currently advertising it.

use std::collections::{HashMap, HashSet};

use crate::connection::ConnectionId;

#[derive(Debug, Default)]
pub struct LabelRegistry {
    by_label: HashMap<String, HashSet<ConnectionId>>,
}

impl LabelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections_by_label(&self, label: &str) -> HashSet<ConnectionId> {
        self.by_label.get(label).cloned().unwrap_or_default()
    }

    pub fn count(&self, label: &str) -> usize {
        self.by_label.get(label).map_or(0, HashSet::len)
    }

    /// Replace a connection's advertised labels wholesale, dropping any label left
    /// with no connections behind it.
    pub fn set_labels(&mut self, conn: ConnectionId, old: &[String], new: &[String]) {
        for label in old {
            if let Some(set) = self.by_label.get_mut(label) {
                set.remove(&conn);
                if set.is_empty() {
                    self.by_label.remove(label);
                }
            }
        }
        for label in new {
            if !label.is_empty() {
                self.by_label.entry(label.clone()).or_default().insert(conn);
            }
        }
    }

    pub fn remove_connection(&mut self, conn: ConnectionId, labels: &[String]) {
        self.set_labels(conn, labels, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_labels_moves_connection_between_sets() {
        let mut reg = LabelRegistry::new();
        let a = ConnectionId::from_raw(1);
        reg.set_labels(a, &[], &["renderer".into()]);
        assert_eq!(reg.count("renderer"), 1);
        reg.set_labels(a, &["renderer".into()], &["encoder".into()]);
        assert_eq!(reg.count("renderer"), 0);
        assert_eq!(reg.count("encoder"), 1);
    }

    #[test]
    fn remove_connection_clears_empty_labels() {
        let mut reg = LabelRegistry::new();
        let a = ConnectionId::from_raw(1);
        reg.set_labels(a, &[], &["renderer".into()]);
        reg.remove_connection(a, &["renderer".into()]);
        assert_eq!(reg.connections_by_label("renderer"), Default::default());
    }
}
