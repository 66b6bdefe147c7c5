//! RocksDB-backed deliberation storage.
//!
//! Implements [`DeliberationStore`] with one column family per entity plus a
//! per-deliberation index. Every commit is a single [`WriteBatch`], and
//! conditional commits evaluate their guards and write while holding the
//! store's commit mutex, so two racing claims can never both apply.

use std::path::Path;

use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, SliceTransform, WriteBatch, DB};

use chant_core::error::StoreError;
use chant_core::store::{all_hold, Condition, DeliberationStore, RowLookup, Write, WriteSet};
use chant_core::types::{
    Cell, CellId, CellParticipation, Comment, CommentId, Deliberation, DeliberationId, Idea,
    IdeaId, Prediction, PredictionId, UserId, UserStats, Vote,
};

// --- Column family names ---

const CF_DELIBERATIONS: &str = "deliberations";
const CF_IDEAS: &str = "ideas";
const CF_CELLS: &str = "cells";
const CF_MEMBERS: &str = "members";
const CF_PARTICIPATIONS: &str = "participations";
const CF_VOTES: &str = "votes";
const CF_PREDICTIONS: &str = "predictions";
const CF_COMMENTS: &str = "comments";
const CF_USER_STATS: &str = "user_stats";
const CF_DELIBERATION_INDEX: &str = "deliberation_index";
const CF_METADATA: &str = "metadata";

/// All column family names.
const ALL_CFS: &[&str] = &[
    CF_DELIBERATIONS,
    CF_IDEAS,
    CF_CELLS,
    CF_MEMBERS,
    CF_PARTICIPATIONS,
    CF_VOTES,
    CF_PREDICTIONS,
    CF_COMMENTS,
    CF_USER_STATS,
    CF_DELIBERATION_INDEX,
    CF_METADATA,
];

/// Column families keyed by an 8-byte owner id followed by a suffix.
const PREFIXED_CFS: &[&str] = &[CF_MEMBERS, CF_PARTICIPATIONS, CF_VOTES, CF_DELIBERATION_INDEX];

// --- Metadata keys ---

const META_NEXT_ID: &[u8] = b"next_id";

// --- Index kinds (byte after the deliberation id in CF_DELIBERATION_INDEX) ---

const IDX_IDEA: u8 = b'i';
const IDX_CELL: u8 = b'c';
const IDX_PREDICTION: u8 = b'p';
const IDX_COMMENT: u8 = b'm';

fn backend(e: rocksdb::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Codec(e.to_string()))
}

/// RocksDB-backed persistent deliberation store.
pub struct RocksStore {
    db: DB,
    /// Last allocated identifier; persisted on every allocation.
    last_id: Mutex<u64>,
    /// Serialises every commit so conditions and writes are atomic together.
    commit_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a store at the given path.
    ///
    /// Creates all column families if they don't exist and resumes id
    /// allocation where the previous process stopped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                if PREFIXED_CFS.contains(name) {
                    opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(8));
                }
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors).map_err(backend)?;

        let mut store = Self {
            db,
            last_id: Mutex::new(0),
            commit_lock: Mutex::new(()),
        };
        let last = store.read_last_id()?;
        *store.last_id.get_mut() = last;
        Ok(store)
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(backend)
    }

    /// Trigger manual compaction across all column families.
    pub fn compact(&self) -> Result<(), StoreError> {
        for cf_name in ALL_CFS {
            let cf = self.cf_handle(cf_name)?;
            self.db.compact_range_cf(&cf, None::<&[u8]>, None::<&[u8]>);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("missing column family: {name}")))
    }

    fn index_key(deliberation: DeliberationId, kind: u8, id: u64) -> [u8; 17] {
        let mut key = [0u8; 17];
        key[0..8].copy_from_slice(&deliberation.to_be_bytes());
        key[8] = kind;
        key[9..17].copy_from_slice(&id.to_be_bytes());
        key
    }

    fn owned_key(owner: [u8; 8], user: &UserId) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + user.as_str().len());
        key.extend_from_slice(&owner);
        key.extend_from_slice(user.as_str().as_bytes());
        key
    }

    /// `cell ++ len(user) ++ user`: the prefix shared by one user's ballot.
    fn ballot_prefix(cell: CellId, user: &UserId) -> Result<Vec<u8>, StoreError> {
        let name = user.as_str().as_bytes();
        let len = u16::try_from(name.len())
            .map_err(|_| StoreError::Codec(format!("user id too long: {} bytes", name.len())))?;
        let mut key = Vec::with_capacity(10 + name.len() + 8);
        key.extend_from_slice(&cell.to_be_bytes());
        key.extend_from_slice(&len.to_be_bytes());
        key.extend_from_slice(name);
        Ok(key)
    }

    fn vote_key(vote: &Vote) -> Result<Vec<u8>, StoreError> {
        let mut key = Self::ballot_prefix(vote.cell_id, &vote.user_id)?;
        key.extend_from_slice(&vote.idea_id.to_be_bytes());
        Ok(key)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn get<T: bincode::Decode<()>>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.get_cf(&cf, key).map_err(backend)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Every `(key, value)` whose key starts with `prefix`, in key order.
    fn scan(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let cf = self.cf_handle(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(backend)?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key, value));
        }
        Ok(rows)
    }

    /// Rows of `cf_name` referenced by the deliberation index under `kind`.
    fn indexed<T: bincode::Decode<()>>(
        &self,
        deliberation: &DeliberationId,
        kind: u8,
        cf_name: &str,
    ) -> Result<Vec<T>, StoreError> {
        let mut prefix = deliberation.to_be_bytes().to_vec();
        prefix.push(kind);
        let mut rows = Vec::new();
        for (key, _) in self.scan(CF_DELIBERATION_INDEX, &prefix)? {
            let id = &key[9..];
            match self.get(cf_name, id)? {
                Some(row) => rows.push(row),
                None => {
                    return Err(StoreError::Missing(format!(
                        "{cf_name} row {} indexed under {deliberation}",
                        hex::encode(id)
                    )));
                }
            }
        }
        Ok(rows)
    }

    fn read_last_id(&self) -> Result<u64, StoreError> {
        let cf = self.cf_handle(CF_METADATA)?;
        match self.db.get_cf(&cf, META_NEXT_ID).map_err(backend)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Codec("invalid next_id length".into()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    fn stage(&self, batch: &mut WriteBatch, write: &Write) -> Result<(), StoreError> {
        match write {
            Write::Deliberation(d) => {
                batch.put_cf(self.cf_handle(CF_DELIBERATIONS)?, d.id.to_be_bytes(), encode(d)?);
            }
            Write::Idea(i) => {
                batch.put_cf(self.cf_handle(CF_IDEAS)?, i.id.to_be_bytes(), encode(i)?);
                batch.put_cf(
                    self.cf_handle(CF_DELIBERATION_INDEX)?,
                    Self::index_key(i.deliberation_id, IDX_IDEA, i.id.0),
                    [],
                );
            }
            Write::Cell(c) => {
                batch.put_cf(self.cf_handle(CF_CELLS)?, c.id.to_be_bytes(), encode(c)?);
                batch.put_cf(
                    self.cf_handle(CF_DELIBERATION_INDEX)?,
                    Self::index_key(c.deliberation_id, IDX_CELL, c.id.0),
                    [],
                );
            }
            Write::Member { deliberation, user } => {
                batch.put_cf(
                    self.cf_handle(CF_MEMBERS)?,
                    Self::owned_key(deliberation.to_be_bytes(), user),
                    encode(user)?,
                );
            }
            Write::Participation(p) => {
                batch.put_cf(
                    self.cf_handle(CF_PARTICIPATIONS)?,
                    Self::owned_key(p.cell_id.to_be_bytes(), &p.user_id),
                    encode(p)?,
                );
            }
            Write::Vote(v) => {
                batch.put_cf(self.cf_handle(CF_VOTES)?, Self::vote_key(v)?, encode(v)?);
            }
            Write::ClearBallot { cell, user } => {
                // Idea ids are 8 bytes, so every key of this ballot sorts below prefix ++ 0xFF * 9.
                let from = Self::ballot_prefix(*cell, user)?;
                let mut to = from.clone();
                to.extend_from_slice(&[0xFF; 9]);
                batch.delete_range_cf(self.cf_handle(CF_VOTES)?, from, to);
            }
            Write::Prediction(p) => {
                batch.put_cf(self.cf_handle(CF_PREDICTIONS)?, p.id.to_be_bytes(), encode(p)?);
                batch.put_cf(
                    self.cf_handle(CF_DELIBERATION_INDEX)?,
                    Self::index_key(p.deliberation_id, IDX_PREDICTION, p.id.0),
                    [],
                );
            }
            Write::Comment(c) => {
                batch.put_cf(self.cf_handle(CF_COMMENTS)?, c.id.to_be_bytes(), encode(c)?);
                batch.put_cf(
                    self.cf_handle(CF_DELIBERATION_INDEX)?,
                    Self::index_key(c.deliberation_id, IDX_COMMENT, c.id.0),
                    [],
                );
            }
            Write::UserStats(s) => {
                batch.put_cf(
                    self.cf_handle(CF_USER_STATS)?,
                    s.user_id.as_str().as_bytes(),
                    encode(s)?,
                );
            }
        }
        Ok(())
    }

    fn write_set(&self, writes: &WriteSet) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for write in writes.iter() {
            self.stage(&mut batch, write)?;
        }
        self.db.write(batch).map_err(backend)
    }
}

impl RowLookup for RocksStore {
    fn lookup_deliberation(&self, id: &DeliberationId) -> Result<Option<Deliberation>, StoreError> {
        self.get(CF_DELIBERATIONS, &id.to_be_bytes())
    }

    fn lookup_cell(&self, id: &CellId) -> Result<Option<Cell>, StoreError> {
        self.get(CF_CELLS, &id.to_be_bytes())
    }

    fn lookup_idea(&self, id: &IdeaId) -> Result<Option<Idea>, StoreError> {
        self.get(CF_IDEAS, &id.to_be_bytes())
    }

    fn participant_count(&self, cell: &CellId) -> Result<usize, StoreError> {
        Ok(self.scan(CF_PARTICIPATIONS, &cell.to_be_bytes())?.len())
    }

    fn lookup_prediction(&self, id: &PredictionId) -> Result<Option<Prediction>, StoreError> {
        self.get(CF_PREDICTIONS, &id.to_be_bytes())
    }

    fn lookup_comment(&self, id: &CommentId) -> Result<Option<Comment>, StoreError> {
        self.get(CF_COMMENTS, &id.to_be_bytes())
    }

    fn lookup_user_stats(&self, user: &UserId) -> Result<UserStats, StoreError> {
        Ok(self
            .get(CF_USER_STATS, user.as_str().as_bytes())?
            .unwrap_or_else(|| UserStats::new(user.clone())))
    }
}

impl DeliberationStore for RocksStore {
    fn next_id(&self) -> Result<u64, StoreError> {
        let mut last = self.last_id.lock();
        let id = *last + 1;
        let cf = self.cf_handle(CF_METADATA)?;
        self.db
            .put_cf(&cf, META_NEXT_ID, id.to_be_bytes())
            .map_err(backend)?;
        *last = id;
        Ok(id)
    }

    fn deliberation(&self, id: &DeliberationId) -> Result<Option<Deliberation>, StoreError> {
        self.lookup_deliberation(id)
    }

    fn deliberation_ids(&self) -> Result<Vec<DeliberationId>, StoreError> {
        let cf = self.cf_handle(CF_DELIBERATIONS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(backend)?;
            let raw: [u8; 8] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Codec("invalid deliberation key length".into()))?;
            ids.push(DeliberationId(u64::from_be_bytes(raw)));
        }
        Ok(ids)
    }

    fn idea(&self, id: &IdeaId) -> Result<Option<Idea>, StoreError> {
        self.lookup_idea(id)
    }

    fn ideas(&self, deliberation: &DeliberationId) -> Result<Vec<Idea>, StoreError> {
        self.indexed(deliberation, IDX_IDEA, CF_IDEAS)
    }

    fn cell(&self, id: &CellId) -> Result<Option<Cell>, StoreError> {
        self.lookup_cell(id)
    }

    fn cells(&self, deliberation: &DeliberationId) -> Result<Vec<Cell>, StoreError> {
        self.indexed(deliberation, IDX_CELL, CF_CELLS)
    }

    fn members(&self, deliberation: &DeliberationId) -> Result<Vec<UserId>, StoreError> {
        self.scan(CF_MEMBERS, &deliberation.to_be_bytes())?
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    fn participants(&self, cell: &CellId) -> Result<Vec<CellParticipation>, StoreError> {
        self.scan(CF_PARTICIPATIONS, &cell.to_be_bytes())?
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    fn votes(&self, cell: &CellId) -> Result<Vec<Vote>, StoreError> {
        self.scan(CF_VOTES, &cell.to_be_bytes())?
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    fn predictions(&self, deliberation: &DeliberationId) -> Result<Vec<Prediction>, StoreError> {
        self.indexed(deliberation, IDX_PREDICTION, CF_PREDICTIONS)
    }

    fn comments(&self, deliberation: &DeliberationId) -> Result<Vec<Comment>, StoreError> {
        self.indexed(deliberation, IDX_COMMENT, CF_COMMENTS)
    }

    fn comment(&self, id: &CommentId) -> Result<Option<Comment>, StoreError> {
        self.lookup_comment(id)
    }

    fn user_stats(&self, user: &UserId) -> Result<UserStats, StoreError> {
        self.lookup_user_stats(user)
    }

    fn commit(&self, writes: WriteSet) -> Result<(), StoreError> {
        let _guard = self.commit_lock.lock();
        self.write_set(&writes)
    }

    fn commit_if(&self, conditions: &[Condition], writes: WriteSet) -> Result<bool, StoreError> {
        let _guard = self.commit_lock.lock();
        if !all_hold(conditions, self)? {
            return Ok(false);
        }
        self.write_set(&writes)?;
        Ok(true)
    }
}
