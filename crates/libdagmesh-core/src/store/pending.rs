use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::types::commit::Commit;
use crate::types::ids::Cid;

struct Entry {
    commit: Commit,
    missing: BTreeSet<Cid>,
}

/// Commits that arrived before their dependencies.
///
/// Held commits are invisible to readers; they are handed back in causal
/// order once every dependency has been stored.
#[derive(Default)]
pub struct PendingBuffer {
    entries: HashMap<Cid, Entry>,
    waiters: HashMap<Cid, BTreeSet<Cid>>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `commit` until every cid in `missing` has arrived
    pub fn hold(&mut self, commit: Commit, missing: impl IntoIterator<Item = Cid>) {
        let cid = commit.cid();
        if self.entries.contains_key(&cid) {
            return;
        }
        let missing: BTreeSet<Cid> = missing.into_iter().collect();
        for dep in &missing {
            self.waiters.entry(*dep).or_default().insert(cid);
        }
        self.entries.insert(cid, Entry { commit, missing });
    }

    /// Record that `arrived` are now stored and return every held commit
    /// that became ready, parents before children.
    pub fn release(&mut self, arrived: impl IntoIterator<Item = Cid>) -> Vec<Commit> {
        let mut queue: VecDeque<Cid> = arrived.into_iter().collect();
        let mut ready = Vec::new();

        while let Some(cid) = queue.pop_front() {
            let Some(children) = self.waiters.remove(&cid) else {
                continue;
            };
            for child in children {
                let now_ready = match self.entries.get_mut(&child) {
                    Some(entry) => {
                        entry.missing.remove(&cid);
                        entry.missing.is_empty()
                    }
                    None => false,
                };
                if now_ready {
                    if let Some(entry) = self.entries.remove(&child) {
                        ready.push(entry.commit);
                        queue.push_back(child);
                    }
                }
            }
        }
        ready
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.entries.contains_key(cid)
    }

    /// A held commit, still waiting for its dependencies
    pub fn get(&self, cid: &Cid) -> Option<&Commit> {
        self.entries.get(cid).map(|entry| &entry.commit)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dependencies that are neither stored nor held themselves
    pub fn missing(&self) -> Vec<Cid> {
        self.waiters
            .keys()
            .filter(|cid| !self.entries.contains_key(*cid))
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
