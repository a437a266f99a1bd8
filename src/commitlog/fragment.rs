// Copyright 2020 Joyent, Inc.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

/// Index of a fragment record inside a `FragmentArena`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentId(usize);

/// One commit-log fragment file.
#[derive(Debug, Clone)]
pub struct CommitLogFileInfo {
    pub log_dir: String,
    pub num: u32,
    pub size: u64,
    /// Highest revision stored in the fragment.
    pub revision: i64,
    /// Number of fragments that list this one as their parent.
    pub references: u32,
    /// The fragment whose COMMITLINK block brought this one in.
    pub parent: Option<FragmentId>,
    /// Linked log directories to delete along with this fragment.
    pub purge_dirs: BTreeSet<String>,
}

impl CommitLogFileInfo {
    pub fn new(log_dir: &str, num: u32, size: u64, revision: i64) -> CommitLogFileInfo {
        CommitLogFileInfo {
            log_dir: log_dir.to_string(),
            num,
            size,
            revision,
            references: 0,
            parent: None,
            purge_dirs: BTreeSet::new(),
        }
    }

    pub fn fname(&self) -> String {
        format!("{}/{}", self.log_dir, self.num)
    }

    /// A fragment may be removed if it belongs to this log, or if the log it
    /// was linked from has been declared removable.
    pub fn remove_ok(&self, remove_ok_logs: &HashSet<String>) -> bool {
        self.parent.is_none() || remove_ok_logs.contains(&self.log_dir)
    }
}

impl fmt::Display for CommitLogFileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{dir={},num={},size={},revision={},references={}",
            self.log_dir, self.num, self.size, self.revision, self.references
        )?;
        if !self.purge_dirs.is_empty() {
            let dirs: Vec<&str> = self.purge_dirs.iter().map(String::as_str).collect();
            write!(f, ",purge_dirs={}", dirs.join(","))?;
        }
        f.write_str("}")
    }
}

#[derive(Debug, Default)]
pub struct FragmentArena {
    slots: Vec<Option<CommitLogFileInfo>>,
}

impl FragmentArena {
    pub fn new() -> FragmentArena {
        FragmentArena::default()
    }

    pub fn insert(&mut self, info: CommitLogFileInfo) -> FragmentId {
        self.slots.push(Some(info));
        FragmentId(self.slots.len() - 1)
    }

    pub fn get(&self, id: FragmentId) -> Option<&CommitLogFileInfo> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: FragmentId) -> Option<&mut CommitLogFileInfo> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Removes a record and drops the reference it held on its parent.
    pub fn remove(&mut self, id: FragmentId) -> Option<CommitLogFileInfo> {
        let info = self.slots.get_mut(id.0).and_then(Option::take)?;
        if let Some(parent) = info.parent.and_then(|p| self.get_mut(p)) {
            parent.references = parent.references.saturating_sub(1);
        }
        Some(info)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sets `parent` on `child` and counts the reference.
    pub fn set_parent(&mut self, child: FragmentId, parent: FragmentId) {
        if let Some(info) = self.get_mut(child) {
            info.parent = Some(parent);
        } else {
            return;
        }
        if let Some(info) = self.get_mut(parent) {
            info.references += 1;
        }
    }

    /// Number of the fragment in the top-level log that `id` descends from.
    pub fn toplevel_fragment_num(&self, id: FragmentId) -> Option<u32> {
        let mut cur = self.get(id)?;
        while let Some(parent) = cur.parent.and_then(|p| self.get(p)) {
            cur = parent;
        }
        Some(cur.num)
    }

    /// Moves the records named in `ids` (and their ancestors) out of
    /// `other` into this arena, preserving parent links.  Returns the new
    /// ids in the order given.
    pub fn absorb(&mut self, other: &mut FragmentArena, ids: &[FragmentId]) -> Vec<FragmentId> {
        let mut remap: HashMap<FragmentId, FragmentId> = HashMap::new();
        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(new_id) = self.absorb_one(other, *id, &mut remap) {
                result.push(new_id);
            }
        }
        result
    }

    fn absorb_one(
        &mut self,
        other: &mut FragmentArena,
        id: FragmentId,
        remap: &mut HashMap<FragmentId, FragmentId>,
    ) -> Option<FragmentId> {
        if let Some(new_id) = remap.get(&id) {
            return Some(*new_id);
        }
        let mut info = other.slots.get_mut(id.0).and_then(Option::take)?;
        info.parent = match info.parent {
            Some(parent) => self.absorb_one(other, parent, remap),
            None => None,
        };
        let new_id = self.insert(info);
        remap.insert(id, new_id);
        Some(new_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_references_follow_removal() {
        let mut arena = FragmentArena::new();
        let link = arena.insert(CommitLogFileInfo::new("/log/user", 4, 100, 50));
        let a = arena.insert(CommitLogFileInfo::new("/log/xfer", 0, 10, 20));
        let b = arena.insert(CommitLogFileInfo::new("/log/xfer", 1, 10, 30));
        arena.set_parent(a, link);
        arena.set_parent(b, link);
        assert_eq!(arena.get(link).unwrap().references, 2);
        assert_eq!(arena.toplevel_fragment_num(b), Some(4));

        arena.remove(a);
        assert_eq!(arena.get(link).unwrap().references, 1);
        assert!(arena.get(a).is_none());
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn remove_ok_rules() {
        let mut ok_logs = HashSet::new();
        let mut info = CommitLogFileInfo::new("/log/xfer", 0, 10, 20);
        assert!(info.remove_ok(&ok_logs));
        info.parent = Some(FragmentId(0));
        assert!(!info.remove_ok(&ok_logs));
        ok_logs.insert(String::from("/log/xfer"));
        assert!(info.remove_ok(&ok_logs));
    }

    #[test]
    fn absorb_keeps_lineage() {
        let mut src = FragmentArena::new();
        let parent = src.insert(CommitLogFileInfo::new("/log/a", 1, 10, 5));
        let child = src.insert(CommitLogFileInfo::new("/log/b", 0, 10, 3));
        src.set_parent(child, parent);

        let mut dst = FragmentArena::new();
        dst.insert(CommitLogFileInfo::new("/log/c", 0, 10, 1));
        let ids = dst.absorb(&mut src, &[child, parent]);
        assert_eq!(ids.len(), 2);
        assert!(src.is_empty());
        let moved_child = dst.get(ids[0]).unwrap();
        assert_eq!(moved_child.parent, Some(ids[1]));
        assert_eq!(dst.get(ids[1]).unwrap().references, 1);
        assert_eq!(dst.toplevel_fragment_num(ids[0]), Some(1));
    }

    #[test]
    fn display_lists_purge_dirs() {
        let mut info = CommitLogFileInfo::new("/log/user", 2, 300, 9);
        info.purge_dirs.insert(String::from("/log/xfer"));
        assert_eq!(
            info.to_string(),
            "{dir=/log/user,num=2,size=300,revision=9,references=0,purge_dirs=/log/xfer}"
        );
    }
}
