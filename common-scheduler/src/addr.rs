//! Dependency addresses: a scheduled action's reads and writes are
//! addresses within the document tree (spec.md §4.8).

use common_path::{Entity, PathBuf, Space};

/// A single location an action can read from or write to.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Addr {
    pub space: Space,
    pub entity: Entity,
    pub path: PathBuf,
}

impl Addr {
    pub fn new(space: Space, entity: Entity, path: PathBuf) -> Self {
        Self { space, entity, path }
    }

    /// True iff a write at `write` should dirty an action that reads
    /// `self`: same (space, entity) and `self` is a prefix of (or equal
    /// to) `write`'s path, i.e. the write lands at or below what was
    /// read.
    pub fn covers_write(&self, write: &Addr) -> bool {
        self.space == write.space
            && self.entity == write.entity
            && self.path.as_path().is_ancestor(write.path.as_path())
    }
}

/// A declared read, optionally exempted from dirty-tracking (spec.md
/// §4.8 `ignoreReadForScheduling`).
#[derive(Clone, Debug)]
pub struct ReadSpec {
    pub addr: Addr,
    pub ignore_for_scheduling: bool,
}

impl ReadSpec {
    pub fn tracked(addr: Addr) -> Self {
        Self { addr, ignore_for_scheduling: false }
    }

    pub fn untracked(addr: Addr) -> Self {
        Self { addr, ignore_for_scheduling: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_path::Token;

    fn addr(entity: &str, path: &str) -> Addr {
        Addr::new(Space::new("did:test"), Entity::new(entity), PathBuf::from_json_pointer(path))
    }

    #[test]
    fn ancestor_read_covers_descendant_write() {
        let read = addr("e1", "/todos");
        let write = addr("e1", "/todos/0/title");
        assert!(read.covers_write(&write));
    }

    #[test]
    fn sibling_paths_do_not_cover() {
        let read = addr("e1", "/todos/0");
        let write = addr("e1", "/todos/1");
        assert!(!read.covers_write(&write));
    }

    #[test]
    fn different_entity_never_covers() {
        let read = addr("e1", "/todos");
        let write = addr("e2", "/todos/0");
        assert!(!read.covers_write(&write));
    }

    #[test]
    fn token_field_path_round_trips_through_addr() {
        let path = PathBuf::root().child(Token::field("x"));
        let a = Addr::new(Space::new("s"), Entity::new("e"), path.clone());
        assert_eq!(a.path, path);
    }
}
