//! Arena-style commit store backed by sled
//!
//! Commits are keyed by CID and never rewritten. A commit is only accepted
//! once every parent it names is already present, which rules out cycles.
//! Head sets are stored as a single value per document (and per branchable
//! collection) so that a reader always sees one consistent snapshot.

mod pending;

pub use pending::PendingBuffer;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fs::File;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use sled::transaction::{
    ConflictableTransactionError, TransactionalTree, Transactional, UnabortableTransactionError,
};
use tracing::debug;

use crate::encoding::{from_cbor, to_cbor};
use crate::error::MeshError;
use crate::types::commit::{Commit, CompositeCommit};
use crate::types::ids::{doc_id_to_string, id_to_hex, short_hex, Cid, DocId};

/// Statistics about the store
#[derive(Debug)]
pub struct StoreStats {
    pub path: Option<String>,
    pub size_bytes: u64,
    pub commit_count: usize,
    pub document_count: usize,
    pub last_rebuild: Option<DateTime<Utc>>,
}

/// Statistics from a rebuild operation
#[derive(Debug)]
pub struct RebuildStats {
    pub commit_count: usize,
    pub document_count: usize,
    pub collection_count: usize,
}

/// Result of writing a batch of commits
#[derive(Debug, Default, Clone)]
pub struct IngestOutcome {
    /// Commits that were not present before, in insertion order
    pub inserted: Vec<Cid>,
}

impl IngestOutcome {
    pub fn is_new(&self, cid: &Cid) -> bool {
        self.inserted.contains(cid)
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
    }
}

/// A CommitStore with filesystem-level exclusive lock.
///
/// The lock is held for the lifetime of this struct and released on drop, so
/// two processes never open the same sled directory.
pub struct LockedStore {
    _lock_file: File,
    store: CommitStore,
}

impl std::fmt::Debug for LockedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedStore")
            .field("store", &"CommitStore { ... }")
            .finish()
    }
}

impl LockedStore {
    pub fn inner(&self) -> &CommitStore {
        &self.store
    }

    /// Release the lock file and keep the store
    pub fn into_inner(self) -> (CommitStore, File) {
        (self.store, self._lock_file)
    }
}

impl std::ops::Deref for LockedStore {
    type Target = CommitStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

struct Prepared {
    cid: Cid,
    commit: Commit,
    bytes: Vec<u8>,
}

/// Commit storage backed by sled
#[derive(Clone)]
pub struct CommitStore {
    db: sled::Db,
    commits: sled::Tree,
    doc_heads: sled::Tree,
    collection_heads: sled::Tree,
    collection_docs: sled::Tree,
    doc_meta: sled::Tree,
    metadata: sled::Tree,
}

impl CommitStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path) -> Result<Self, MeshError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Open a store that lives in memory and is discarded on drop
    pub fn open_temporary() -> Result<Self, MeshError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, MeshError> {
        let commits = db.open_tree("commits")?;
        let doc_heads = db.open_tree("doc_heads")?;
        let collection_heads = db.open_tree("collection_heads")?;
        let collection_docs = db.open_tree("collection_docs")?;
        let doc_meta = db.open_tree("doc_meta")?;
        let metadata = db.open_tree("metadata")?;
        Ok(Self {
            db,
            commits,
            doc_heads,
            collection_heads,
            collection_docs,
            doc_meta,
            metadata,
        })
    }

    /// Open store with exclusive filesystem lock (non-blocking).
    ///
    /// Lock file is created at `<path>.lock`.
    /// Returns `MeshError::DbBusy` if another process holds the lock.
    pub fn open_locked(path: &Path) -> Result<LockedStore, MeshError> {
        let lock_path = path.with_extension("lock");
        let lock_file = File::create(&lock_path)?;

        lock_file.try_lock_exclusive().map_err(|e| {
            MeshError::DbBusy(format!("Database locked by another process: {}", e))
        })?;

        let store = Self::open(path)?;
        Ok(LockedStore {
            _lock_file: lock_file,
            store,
        })
    }

    /// Open store with exclusive filesystem lock, retrying with exponential
    /// backoff until `timeout` expires.
    pub fn open_locked_blocking(path: &Path, timeout: Duration) -> Result<LockedStore, MeshError> {
        let lock_path = path.with_extension("lock");
        let lock_file = File::create(&lock_path)?;

        let start = Instant::now();
        let mut delay = Duration::from_millis(10);

        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if start.elapsed() < timeout => {
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_millis(200));
                }
                Err(e) => {
                    return Err(MeshError::DbBusy(format!(
                        "Timeout waiting for database lock: {}",
                        e
                    )))
                }
            }
        }

        let store = Self::open(path)?;
        Ok(LockedStore {
            _lock_file: lock_file,
            store,
        })
    }

    /// Store a single commit. Re-adding identical content is a no-op.
    pub fn put(&self, commit: &Commit) -> Result<Cid, MeshError> {
        let cid = commit.cid();
        self.ingest(std::slice::from_ref(commit))?;
        Ok(cid)
    }

    /// Store a causally ordered batch atomically.
    ///
    /// Every parent must be present in the store or earlier in the batch,
    /// otherwise nothing is written and `MissingParents` is returned.
    pub fn ingest(&self, commits: &[Commit]) -> Result<IngestOutcome, MeshError> {
        let batch = prepare(commits)?;
        self.apply(&batch, None)
    }

    /// Store the commits of a local write, provided the document's heads
    /// still equal `expected_heads`. A concurrent change to the heads aborts
    /// with `TransactionConflict` and writes nothing.
    pub fn commit_local(
        &self,
        doc_id: &DocId,
        expected_heads: &[Cid],
        commits: &[Commit],
    ) -> Result<IngestOutcome, MeshError> {
        let batch = prepare(commits)?;
        self.apply(&batch, Some((doc_id, expected_heads)))
    }

    fn apply(
        &self,
        batch: &[Prepared],
        expect: Option<(&DocId, &[Cid])>,
    ) -> Result<IngestOutcome, MeshError> {
        let expected: Option<(DocId, Vec<Cid>)> = expect.map(|(doc, heads)| {
            let mut heads = heads.to_vec();
            heads.sort();
            heads.dedup();
            (*doc, heads)
        });

        let inserted = (
            &self.commits,
            &self.doc_heads,
            &self.collection_heads,
            &self.collection_docs,
            &self.doc_meta,
        )
            .transaction(|(commits, doc_heads, coll_heads, coll_docs, doc_meta)| {
                if let Some((doc_id, expected)) = &expected {
                    let current = read_heads(doc_heads, doc_id)?;
                    if &current != expected {
                        return Err(ConflictableTransactionError::Abort(
                            MeshError::TransactionConflict(format!(
                                "heads of {} changed during write",
                                doc_id_to_string(doc_id)
                            )),
                        ));
                    }
                }

                let mut inserted = Vec::new();
                for p in batch {
                    if commits.get(&p.cid[..])?.is_some() {
                        continue;
                    }

                    let mut missing = Vec::new();
                    for parent in p.commit.parents() {
                        if commits.get(&parent[..])?.is_none() {
                            missing.push(id_to_hex(parent));
                        }
                    }
                    if !missing.is_empty() {
                        return Err(ConflictableTransactionError::Abort(
                            MeshError::MissingParents {
                                cid: id_to_hex(&p.cid),
                                missing,
                            },
                        ));
                    }

                    commits.insert(&p.cid[..], p.bytes.as_slice())?;

                    match &p.commit {
                        Commit::Composite(c) => {
                            advance_heads(doc_heads, &c.doc_id, &c.parents, &p.cid)?;
                            if doc_meta.get(&c.doc_id[..])?.is_none() {
                                doc_meta.insert(&c.doc_id[..], c.collection.as_bytes())?;
                                coll_docs.insert(
                                    collection_doc_key(&c.collection, &c.doc_id),
                                    &[] as &[u8],
                                )?;
                            }
                        }
                        Commit::Collection(c) => {
                            advance_heads(coll_heads, c.collection.as_bytes(), &c.parents, &p.cid)?;
                        }
                        Commit::Field(_) => {}
                    }
                    inserted.push(p.cid);
                }
                Ok(inserted)
            })?;

        if !inserted.is_empty() {
            debug!(count = inserted.len(), first = %short_hex(&inserted[0]), "commits stored");
        }
        Ok(IngestOutcome { inserted })
    }

    /// Get a commit by CID
    pub fn get(&self, cid: &Cid) -> Result<Commit, MeshError> {
        match self.commits.get(&cid[..])? {
            Some(bytes) => from_cbor(&bytes),
            None => Err(MeshError::NotFound(format!("commit {}", id_to_hex(cid)))),
        }
    }

    pub fn contains(&self, cid: &Cid) -> Result<bool, MeshError> {
        Ok(self.commits.contains_key(&cid[..])?)
    }

    /// Current heads of a document (empty if unknown)
    pub fn heads(&self, doc_id: &DocId) -> Result<Vec<Cid>, MeshError> {
        Ok(self
            .doc_heads
            .get(&doc_id[..])?
            .map(|bytes| decode_heads(&bytes))
            .unwrap_or_default())
    }

    /// Current heads of a branchable collection
    pub fn collection_heads(&self, collection: &str) -> Result<Vec<Cid>, MeshError> {
        Ok(self
            .collection_heads
            .get(collection.as_bytes())?
            .map(|bytes| decode_heads(&bytes))
            .unwrap_or_default())
    }

    /// Collection a stored document belongs to
    pub fn doc_collection(&self, doc_id: &DocId) -> Result<Option<String>, MeshError> {
        Ok(self
            .doc_meta
            .get(&doc_id[..])?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Documents held in a collection, sorted by id
    pub fn documents(&self, collection: &str) -> Result<Vec<DocId>, MeshError> {
        let prefix = collection_doc_prefix(collection);
        let mut docs = Vec::new();
        for result in self.collection_docs.scan_prefix(&prefix) {
            let (key, _) = result?;
            docs.push(doc_id_from_key(&key, prefix.len())?);
        }
        docs.sort();
        Ok(docs)
    }

    /// Every stored document with its collection, sorted by id
    pub fn all_documents(&self) -> Result<Vec<(DocId, String)>, MeshError> {
        let mut docs = Vec::new();
        for result in self.doc_meta.iter() {
            let (key, value) = result?;
            if key.len() != 16 {
                return Err(MeshError::Internal("Invalid doc_meta key".to_string()));
            }
            let mut doc_id = [0u8; 16];
            doc_id.copy_from_slice(&key);
            docs.push((doc_id, String::from_utf8_lossy(&value).into_owned()));
        }
        docs.sort();
        Ok(docs)
    }

    /// Every composite reachable from the document's heads, parents first
    pub fn history(&self, doc_id: &DocId) -> Result<Vec<(Cid, CompositeCommit)>, MeshError> {
        let heads = self.heads(doc_id)?;
        if heads.is_empty() {
            return Err(MeshError::NotFound(format!(
                "document {}",
                doc_id_to_string(doc_id)
            )));
        }

        let mut seen: HashSet<Cid> = HashSet::new();
        let mut queue: VecDeque<Cid> = heads.into_iter().collect();
        let mut out = Vec::new();
        while let Some(cid) = queue.pop_front() {
            if !seen.insert(cid) {
                continue;
            }
            let composite = match self.get(&cid)? {
                Commit::Composite(c) => c,
                other => {
                    return Err(MeshError::Internal(format!(
                        "{} commit {} found in document history",
                        other.kind_name(),
                        id_to_hex(&cid)
                    )))
                }
            };
            queue.extend(composite.parents.iter().copied());
            out.push((cid, composite));
        }
        // priority strictly grows along parent links
        out.sort_by(|a, b| (a.1.priority, a.0).cmp(&(b.1.priority, b.0)));
        Ok(out)
    }

    /// Store a metadata value
    pub fn put_meta(&self, key: &str, value: &[u8]) -> Result<(), MeshError> {
        self.metadata.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, MeshError> {
        Ok(self.metadata.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    /// Recompute head sets and document indexes from the commit arena
    pub fn rebuild_heads(&self) -> Result<RebuildStats, MeshError> {
        self.doc_heads.clear()?;
        self.collection_heads.clear()?;
        self.collection_docs.clear()?;
        self.doc_meta.clear()?;

        let mut doc_nodes: HashMap<DocId, (String, BTreeSet<Cid>)> = HashMap::new();
        let mut coll_nodes: HashMap<String, BTreeSet<Cid>> = HashMap::new();
        let mut superseded: HashSet<Cid> = HashSet::new();
        let mut commit_count = 0;

        for result in self.commits.iter() {
            let (key, value) = result?;
            let commit: Commit = from_cbor(&value)?;
            let cid = cid_from_key(&key)?;
            commit_count += 1;
            superseded.extend(commit.parents().iter().copied());
            match commit {
                Commit::Composite(c) => {
                    doc_nodes
                        .entry(c.doc_id)
                        .or_insert_with(|| (c.collection.clone(), BTreeSet::new()))
                        .1
                        .insert(cid);
                }
                Commit::Collection(c) => {
                    coll_nodes.entry(c.collection).or_default().insert(cid);
                }
                Commit::Field(_) => {}
            }
        }

        for (doc_id, (collection, nodes)) in &doc_nodes {
            let heads: Vec<Cid> = nodes.iter().filter(|c| !superseded.contains(*c)).copied().collect();
            self.doc_heads.insert(&doc_id[..], encode_heads(&heads))?;
            self.doc_meta.insert(&doc_id[..], collection.as_bytes())?;
            self.collection_docs
                .insert(collection_doc_key(collection, doc_id), &[] as &[u8])?;
        }
        for (collection, nodes) in &coll_nodes {
            let heads: Vec<Cid> = nodes.iter().filter(|c| !superseded.contains(*c)).copied().collect();
            self.collection_heads
                .insert(collection.as_bytes(), encode_heads(&heads))?;
        }

        self.metadata
            .insert("last_rebuild", Utc::now().to_rfc3339().as_bytes())?;

        Ok(RebuildStats {
            commit_count,
            document_count: doc_nodes.len(),
            collection_count: coll_nodes.len(),
        })
    }

    /// Get store statistics. `path` is walked for the on-disk size.
    pub fn stats(&self, path: Option<&Path>) -> Result<StoreStats, MeshError> {
        let last_rebuild = self
            .metadata
            .get("last_rebuild")?
            .and_then(|bytes| {
                DateTime::parse_from_rfc3339(&String::from_utf8_lossy(&bytes))
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            });

        Ok(StoreStats {
            path: path.map(|p| p.to_string_lossy().to_string()),
            size_bytes: path.map(|p| dir_size(p).unwrap_or(0)).unwrap_or(0),
            commit_count: self.commits.len(),
            document_count: self.doc_meta.len(),
            last_rebuild,
        })
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), MeshError> {
        self.db.flush()?;
        Ok(())
    }
}

fn prepare(commits: &[Commit]) -> Result<Vec<Prepared>, MeshError> {
    commits
        .iter()
        .map(|commit| {
            Ok(Prepared {
                cid: commit.cid(),
                commit: commit.clone(),
                bytes: to_cbor(commit)?,
            })
        })
        .collect()
}

fn read_heads(tree: &TransactionalTree, key: &[u8]) -> Result<Vec<Cid>, UnabortableTransactionError> {
    Ok(tree.get(key)?.map(|bytes| decode_heads(&bytes)).unwrap_or_default())
}

/// heads := heads - parents + cid
fn advance_heads(
    tree: &TransactionalTree,
    key: &[u8],
    parents: &[Cid],
    cid: &Cid,
) -> Result<(), UnabortableTransactionError> {
    let mut heads = read_heads(tree, key)?;
    heads.retain(|h| !parents.contains(h));
    heads.push(*cid);
    heads.sort();
    heads.dedup();
    tree.insert(key, encode_heads(&heads))?;
    Ok(())
}

fn encode_heads(heads: &[Cid]) -> Vec<u8> {
    let mut out = Vec::with_capacity(heads.len() * 32);
    for h in heads {
        out.extend_from_slice(h);
    }
    out
}

fn decode_heads(bytes: &[u8]) -> Vec<Cid> {
    bytes
        .chunks_exact(32)
        .map(|chunk| {
            let mut cid = [0u8; 32];
            cid.copy_from_slice(chunk);
            cid
        })
        .collect()
}

// Key construction helpers

fn collection_doc_prefix(collection: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(collection.len() + 1);
    key.extend_from_slice(collection.as_bytes());
    key.push(0);
    key
}

fn collection_doc_key(collection: &str, doc_id: &DocId) -> Vec<u8> {
    let mut key = collection_doc_prefix(collection);
    key.extend_from_slice(doc_id);
    key
}

fn doc_id_from_key(key: &[u8], prefix_len: usize) -> Result<DocId, MeshError> {
    let suffix = &key[prefix_len..];
    if suffix.len() != 16 {
        return Err(MeshError::Internal("Invalid collection_docs key".to_string()));
    }
    let mut doc_id = [0u8; 16];
    doc_id.copy_from_slice(suffix);
    Ok(doc_id)
}

fn cid_from_key(key: &[u8]) -> Result<Cid, MeshError> {
    if key.len() != 32 {
        return Err(MeshError::Internal("Invalid commits key".to_string()));
    }
    let mut cid = [0u8; 32];
    cid.copy_from_slice(key);
    Ok(cid)
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut size = 0;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                size += dir_size(&entry.path())?;
            } else {
                size += meta.len();
            }
        }
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::commit::{
        CollectionCommit, CrdtKind, DocStatus, FieldCommit, FieldDelta, FieldLink, FieldPayload,
        Value,
    };
    use tempfile::tempdir;

    const DOC: DocId = [7u8; 16];

    fn field(name: &str, value: i64, priority: u64) -> Commit {
        Commit::Field(FieldCommit {
            doc_id: DOC,
            field: name.to_string(),
            crdt: CrdtKind::LwwRegister,
            priority,
            payload: FieldPayload::Plain(FieldDelta::Lww { value: Value::Int(value) }),
        })
    }

    fn composite(parents: Vec<Cid>, fields: &[&Commit], priority: u64) -> Commit {
        let links = fields
            .iter()
            .map(|f| FieldLink {
                name: f.as_field().unwrap().field.clone(),
                cid: f.cid(),
            })
            .collect();
        Commit::Composite(CompositeCommit::new(DOC, "Users", priority, parents, links, DocStatus::Active))
    }

    #[test]
    fn test_put_get_and_idempotence() {
        let store = CommitStore::open_temporary().unwrap();
        let f = field("age", 21, 1);
        let cid = store.put(&f).unwrap();
        assert_eq!(store.get(&cid).unwrap(), f);

        let again = store.ingest(&[f.clone()]).unwrap();
        assert!(again.is_empty());
        assert_eq!(store.stats(None).unwrap().commit_count, 1);
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let store = CommitStore::open_temporary().unwrap();
        assert!(matches!(store.get(&[1; 32]), Err(MeshError::NotFound(_))));
    }

    #[test]
    fn test_missing_parent_rejected() {
        let store = CommitStore::open_temporary().unwrap();
        let f = field("age", 21, 2);
        let orphan = composite(vec![[9; 32]], &[&f], 2);
        let err = store.ingest(&[f, orphan.clone()]).unwrap_err();
        assert!(matches!(err, MeshError::MissingParents { .. }));
        // nothing from the aborted batch is visible
        assert_eq!(store.stats(None).unwrap().commit_count, 0);
        assert!(store.heads(&DOC).unwrap().is_empty());
    }

    #[test]
    fn test_heads_advance_and_branch() {
        let store = CommitStore::open_temporary().unwrap();
        let f1 = field("age", 1, 1);
        let c1 = composite(vec![], &[&f1], 1);
        store.ingest(&[f1, c1.clone()]).unwrap();
        assert_eq!(store.heads(&DOC).unwrap(), vec![c1.cid()]);

        let f2 = field("age", 2, 2);
        let c2 = composite(vec![c1.cid()], &[&f2], 2);
        let f3 = field("age", 3, 2);
        let c3 = composite(vec![c1.cid()], &[&f3], 2);
        store.ingest(&[f2, c2.clone()]).unwrap();
        store.ingest(&[f3, c3.clone()]).unwrap();

        let mut expected = vec![c2.cid(), c3.cid()];
        expected.sort();
        assert_eq!(store.heads(&DOC).unwrap(), expected);

        let c4 = composite(vec![c2.cid(), c3.cid()], &[], 3);
        store.put(&c4).unwrap();
        assert_eq!(store.heads(&DOC).unwrap(), vec![c4.cid()]);

        let history = store.history(&DOC).unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].0, c1.cid());
        assert_eq!(history[3].0, c4.cid());
    }

    #[test]
    fn test_commit_local_detects_conflict() {
        let store = CommitStore::open_temporary().unwrap();
        let f1 = field("age", 1, 1);
        let c1 = composite(vec![], &[&f1], 1);
        store.commit_local(&DOC, &[], &[f1, c1.clone()]).unwrap();

        let f2 = field("age", 2, 2);
        let c2 = composite(vec![c1.cid()], &[&f2], 2);
        // stale expectation: caller thinks the document has no heads yet
        let err = store.commit_local(&DOC, &[], &[f2.clone(), c2.clone()]).unwrap_err();
        assert!(matches!(err, MeshError::TransactionConflict(_)));
        assert!(!store.contains(&c2.cid()).unwrap());

        store.commit_local(&DOC, &[c1.cid()], &[f2, c2.clone()]).unwrap();
        assert_eq!(store.heads(&DOC).unwrap(), vec![c2.cid()]);
    }

    #[test]
    fn test_document_index() {
        let store = CommitStore::open_temporary().unwrap();
        let f1 = field("age", 1, 1);
        let c1 = composite(vec![], &[&f1], 1);
        store.ingest(&[f1, c1]).unwrap();
        assert_eq!(store.documents("Users").unwrap(), vec![DOC]);
        assert!(store.documents("Books").unwrap().is_empty());
        assert_eq!(store.doc_collection(&DOC).unwrap().as_deref(), Some("Users"));
        assert_eq!(store.all_documents().unwrap(), vec![(DOC, "Users".to_string())]);
    }

    #[test]
    fn test_collection_heads() {
        let store = CommitStore::open_temporary().unwrap();
        let f1 = field("age", 1, 1);
        let c1 = composite(vec![], &[&f1], 1);
        let col1 = Commit::Collection(CollectionCommit::new("Users", 1, vec![], vec![c1.cid()]));
        store.ingest(&[f1, c1, col1.clone()]).unwrap();
        assert_eq!(store.collection_heads("Users").unwrap(), vec![col1.cid()]);
    }

    #[test]
    fn test_rebuild_heads_matches_incremental() {
        let dir = tempdir().unwrap();
        let store = CommitStore::open(dir.path()).unwrap();
        let f1 = field("age", 1, 1);
        let c1 = composite(vec![], &[&f1], 1);
        let f2 = field("age", 2, 2);
        let c2 = composite(vec![c1.cid()], &[&f2], 2);
        store.ingest(&[f1, c1, f2, c2.clone()]).unwrap();

        let before = store.heads(&DOC).unwrap();
        let stats = store.rebuild_heads().unwrap();
        assert_eq!(stats.commit_count, 4);
        assert_eq!(stats.document_count, 1);
        assert_eq!(store.heads(&DOC).unwrap(), before);
        assert_eq!(before, vec![c2.cid()]);
        assert!(store.stats(Some(dir.path())).unwrap().last_rebuild.is_some());
    }

    #[test]
    fn test_meta_roundtrip() {
        let store = CommitStore::open_temporary().unwrap();
        assert!(store.get_meta("peer_state").unwrap().is_none());
        store.put_meta("peer_state", b"{}").unwrap();
        assert_eq!(store.get_meta("peer_state").unwrap().unwrap(), b"{}".to_vec());
    }

    #[test]
    fn test_locked_store_creates_lock_file() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("sled");
        let lock_path = dir.path().join("sled.lock");
        assert!(!lock_path.exists());

        let _store = CommitStore::open_locked(&store_path).unwrap();
        assert!(lock_path.exists());
    }

    #[test]
    fn test_locked_store_second_open_fails() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("sled");

        let _store1 = CommitStore::open_locked(&store_path).unwrap();
        match CommitStore::open_locked(&store_path) {
            Err(MeshError::DbBusy(msg)) => assert!(msg.contains("locked")),
            other => panic!("Expected DbBusy error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_locked_store_released_on_drop() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("sled");
        {
            let _store = CommitStore::open_locked(&store_path).unwrap();
        }
        let _store2 = CommitStore::open_locked(&store_path).unwrap();
    }

    #[test]
    fn test_locked_store_blocking_timeout() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("sled");

        let _store1 = CommitStore::open_locked(&store_path).unwrap();
        match CommitStore::open_locked_blocking(&store_path, Duration::from_millis(50)) {
            Err(MeshError::DbBusy(msg)) => assert!(msg.contains("Timeout")),
            other => panic!("Expected DbBusy timeout error, got {:?}", other.map(|_| ())),
        }
    }
}
