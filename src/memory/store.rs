//! Hybrid store: relationship graph, vector index and hot cache behind one handle.
//!
//! The graph lives in typed SQLite tables (`fragments`, `graph_edges`, ...), the
//! vector index in the sqlite-vec table `fragments_vec`, and hot fragment bodies
//! in an in-process cache. [`HybridStore::put`] writes graph rows and the vector
//! row in one transaction and fills the cache only after commit, so a failed
//! write leaves nothing behind in any substrate.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;

use super::error::{MemoryError, Result};
use super::fingerprint::ContextFingerprint;
use super::quality::QualityUpdate;
use super::temporal::TemporalManager;
use super::types::{
    parse_ts, ts, ConflictLink, EdgeType, FragmentContent, FragmentId, MemoryFragment,
    QualityScores, Scope, TemporalMetadata, UsageStats,
};
use super::{bytes_to_embedding, embedding_to_bytes};
use crate::embedding::EMBEDDING_DIM;

const FRAGMENT_COLUMNS: &str = "f.id, f.agent_type, f.kind, f.content, f.content_digest, \
    f.fingerprint_digest, cf.body, f.scope, f.project_id, f.cross_type_refs, f.quality_score, \
    f.quality_scores, f.validation_count, f.application_count, f.success_rate, f.last_used_at, \
    f.created_at, f.last_validated_at, f.valid_from, f.valid_until, f.deprecated_at, \
    f.archived_at, f.superseded_by, f.replaces, f.version";

/// Largest `k` sqlite-vec accepts for a KNN query.
const MAX_KNN_WINDOW: usize = 4096;

/// A vector-index hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub id: FragmentId,
    /// Cosine similarity between the query and the fragment embedding.
    pub similarity: f64,
}

/// Structural constraints applied to vector candidates.
#[derive(Debug, Clone)]
pub struct StructuralQuery<'a> {
    pub agent_type: &'a str,
    pub context: &'a ContextFingerprint,
    /// Caller's project; project-scoped fragments only pass when it matches.
    pub project_id: Option<&'a str>,
    pub validity_at: DateTime<Utc>,
    /// Keep expired, stale, superseded and archived fragments.
    pub include_historical: bool,
    pub similarity_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuralMatch {
    pub id: FragmentId,
    /// Fingerprint similarity to the query context; `None` for universal scope.
    pub context_similarity: Option<f64>,
}

#[derive(Debug, Default)]
pub struct StructuralFilter {
    pub matches: Vec<StructuralMatch>,
    /// Candidates whose graph rows failed validation, with the reason.
    pub corrupted: Vec<(FragmentId, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualitySnapshot {
    pub version: i64,
    pub quality_score: f64,
    pub reason: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub operation: String,
    pub details: Option<serde_json::Value>,
    pub created_at: String,
}

/// Bounded map of hot fragment bodies, evicting oldest insertions first.
#[derive(Debug)]
struct FragmentCache {
    capacity: usize,
    entries: HashMap<FragmentId, MemoryFragment>,
    order: VecDeque<FragmentId>,
}

impl FragmentCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, id: &str) -> Option<MemoryFragment> {
        self.entries.get(id).cloned()
    }

    fn insert(&mut self, fragment: MemoryFragment) {
        if self.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&fragment.id) {
            self.order.push_back(fragment.id.clone());
        }
        self.entries.insert(fragment.id.clone(), fragment);
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn remove(&mut self, id: &str) {
        if self.entries.remove(id).is_some() {
            self.order.retain(|x| x != id);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The one handle through which every component reaches persisted state.
pub struct HybridStore {
    conn: Arc<Mutex<Connection>>,
    cache: Mutex<FragmentCache>,
}

impl HybridStore {
    pub fn new(conn: Connection, cache_capacity: usize) -> Self {
        Self::from_shared(Arc::new(Mutex::new(conn)), cache_capacity)
    }

    pub fn from_shared(conn: Arc<Mutex<Connection>>, cache_capacity: usize) -> Self {
        Self {
            conn,
            cache: Mutex::new(FragmentCache::new(cache_capacity)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| MemoryError::StorageUnavailable(format!("connection lock poisoned: {e}")))
    }

    fn cache(&self) -> Option<MutexGuard<'_, FragmentCache>> {
        // A poisoned cache only costs hits; the graph is authoritative.
        self.cache.lock().ok()
    }

    /// Run `f` inside a write transaction; commits only if `f` succeeds.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run `f` against a point-in-time view of the graph.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Drop cached bodies after a graph write that touched them.
    pub fn evict<S: AsRef<str>>(&self, ids: &[S]) {
        if let Some(mut cache) = self.cache() {
            for id in ids {
                cache.remove(id.as_ref());
            }
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache().map(|c| c.len()).unwrap_or(0)
    }

    /// Persist a fully built fragment and its embedding.
    pub fn put(&self, fragment: &MemoryFragment, embedding: &[f32]) -> Result<FragmentId> {
        if embedding.len() != EMBEDDING_DIM {
            return Err(MemoryError::Validation(format!(
                "embedding has {} dimensions, expected {EMBEDDING_DIM}",
                embedding.len()
            )));
        }

        self.write(|tx| insert_fragment(tx, fragment, embedding))?;

        if let Some(mut cache) = self.cache() {
            cache.insert(fragment.clone());
        }
        tracing::debug!(id = %fragment.id, agent_type = %fragment.agent_type, "fragment stored");
        Ok(fragment.id.clone())
    }

    /// Fetch one fragment, from the cache when hot.
    pub fn get(&self, id: &str) -> Result<MemoryFragment> {
        if let Some(hit) = self.cache().and_then(|c| c.get(id)) {
            return Ok(hit);
        }
        let fragment = self
            .read(|conn| load_fragment(conn, id))?
            .ok_or_else(|| MemoryError::NotFound(format!("fragment {id}")))?;
        if let Some(mut cache) = self.cache() {
            cache.insert(fragment.clone());
        }
        Ok(fragment)
    }

    /// Fetch straight from the graph, bypassing and refreshing the cache.
    pub fn get_fresh(&self, id: &str) -> Result<MemoryFragment> {
        self.evict(&[id]);
        self.get(id)
    }

    /// Nearest `k` fragments of `agent_type` by embedding distance, closest first.
    ///
    /// The vector index spans every agent type, so the KNN window widens until
    /// it yields `k` rows of `agent_type` or covers the whole index.
    pub fn candidates_by_embedding(
        &self,
        query: &[f32],
        agent_type: &str,
        k: usize,
    ) -> Result<Vec<Candidate>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        self.read(|conn| {
            let indexed: i64 = conn.query_row("SELECT COUNT(*) FROM fragments", [], |row| row.get(0))?;
            let indexed = usize::try_from(indexed).unwrap_or(0);
            let mut stmt = conn.prepare(
                "SELECT v.id, v.distance FROM ( \
                     SELECT id, distance FROM fragments_vec \
                     WHERE embedding MATCH ?1 AND k = ?2 \
                 ) v \
                 JOIN fragments f ON f.id = v.id \
                 WHERE f.agent_type = ?3 \
                 ORDER BY v.distance LIMIT ?4",
            )?;

            let mut window = k.min(MAX_KNN_WINDOW);
            loop {
                let rows = stmt.query_map(
                    params![embedding_to_bytes(query), window as i64, agent_type, k as i64],
                    |row| {
                        let distance: f64 = row.get(1)?;
                        Ok(Candidate {
                            id: row.get(0)?,
                            // unit vectors: cos = 1 - d^2 / 2
                            similarity: (1.0 - distance * distance / 2.0).clamp(-1.0, 1.0),
                        })
                    },
                )?;
                let hits = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                if hits.len() >= k || window >= indexed || window >= MAX_KNN_WINDOW {
                    return Ok(hits);
                }
                tracing::trace!(agent_type, window, hits = hits.len(), "widening KNN window");
                window = (window * 4).min(MAX_KNN_WINDOW);
            }
        })
    }

    /// Keep candidates owned by `query.agent_type` that are valid and apply in its context.
    pub fn filter_by_structure(
        &self,
        ids: &[FragmentId],
        query: &StructuralQuery<'_>,
        temporal: &TemporalManager,
    ) -> Result<StructuralFilter> {
        self.read(|conn| {
            let mut out = StructuralFilter::default();
            let mut stmt = conn.prepare(
                "SELECT f.agent_type, f.scope, f.project_id, cf.body, f.created_at, \
                        f.last_validated_at, f.valid_from, f.valid_until, f.deprecated_at, \
                        f.archived_at, f.superseded_by \
                 FROM fragments f \
                 LEFT JOIN context_fingerprints cf ON cf.digest = f.fingerprint_digest \
                 WHERE f.id = ?1",
            )?;

            for id in ids {
                let row = stmt
                    .query_row(params![id], |row| StructureRow::from_row(row))
                    .optional()?;
                let Some(row) = row else {
                    tracing::debug!(id = %id, "vector row without graph row, skipping");
                    continue;
                };
                if row.agent_type != query.agent_type {
                    continue;
                }

                let shape = match row.decode() {
                    Ok(shape) => shape,
                    Err(reason) => {
                        out.corrupted.push((id.clone(), reason));
                        continue;
                    }
                };

                if !query.include_historical
                    && (shape.archived
                        || shape.superseded
                        || !temporal.window_is_valid(&shape.temporal, query.validity_at))
                {
                    continue;
                }

                let context_similarity = match &shape.scope {
                    Scope::Universal => None,
                    Scope::Contextual => Some(shape.fingerprint.similarity(query.context)),
                    Scope::Project(project) => {
                        if query.project_id != Some(project.as_str()) {
                            continue;
                        }
                        Some(shape.fingerprint.similarity(query.context))
                    }
                };
                if matches!(context_similarity, Some(sim) if sim < query.similarity_threshold) {
                    continue;
                }

                out.matches.push(StructuralMatch {
                    id: id.clone(),
                    context_similarity,
                });
            }
            Ok(out)
        })
    }

    /// Stored embedding for a fragment.
    pub fn embedding_of(&self, id: &str) -> Result<Option<Vec<f32>>> {
        self.read(|conn| {
            let blob: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT embedding FROM fragments_vec WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(blob.map(|b| bytes_to_embedding(&b)))
        })
    }

    /// Optimistic quality update: read a snapshot, compute, write only if the
    /// version is unchanged, retrying with a fresh read up to `max_attempts`.
    ///
    /// `compute` returning `None` means there is nothing to write.
    pub fn update_quality(
        &self,
        id: &str,
        max_attempts: u32,
        compute: impl FnMut(&MemoryFragment) -> Option<QualityUpdate>,
    ) -> Result<Option<MemoryFragment>> {
        self.update_quality_with(id, max_attempts, compute, |_, _| Ok(()))
    }

    /// [`HybridStore::update_quality`] plus `within`, run in the same
    /// transaction after the quality write with the pre-update fragment.
    /// An error from `within` rolls the quality write back.
    pub fn update_quality_with(
        &self,
        id: &str,
        max_attempts: u32,
        mut compute: impl FnMut(&MemoryFragment) -> Option<QualityUpdate>,
        mut within: impl FnMut(&Transaction<'_>, &MemoryFragment) -> Result<()>,
    ) -> Result<Option<MemoryFragment>> {
        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            let current = self
                .read(|conn| load_fragment(conn, id))?
                .ok_or_else(|| MemoryError::NotFound(format!("fragment {id}")))?;

            let Some(update) = compute(&current) else {
                return Ok(None);
            };

            let committed = self.write(|tx| {
                let changed = tx.execute(
                    "UPDATE fragments SET quality_score = ?1, quality_scores = ?2, \
                         validation_count = ?3, application_count = ?4, success_rate = ?5, \
                         last_used_at = ?6, last_validated_at = ?7, version = version + 1 \
                     WHERE id = ?8 AND version = ?9",
                    params![
                        update.quality_score,
                        serde_json::to_string(&update.quality)?,
                        update.usage.validation_count,
                        update.usage.application_count,
                        update.usage.success_rate,
                        update.usage.last_used_at.as_ref().map(ts),
                        ts(&update.last_validated_at),
                        id,
                        current.version,
                    ],
                )?;
                if changed == 0 {
                    return Ok(false);
                }
                insert_snapshot(
                    tx,
                    id,
                    current.version + 1,
                    update.quality_score,
                    &update.quality,
                    update.reason,
                )?;
                write_log(
                    tx,
                    update.reason,
                    id,
                    Some(&serde_json::json!({
                        "from": current.quality_score,
                        "to": update.quality_score,
                    })),
                )?;
                within(tx, &current)?;
                Ok(true)
            })?;

            if committed {
                return self.get_fresh(id).map(Some);
            }
            tracing::debug!(id, attempt, "fragment version moved, retrying quality update");
        }

        tracing::warn!(id, attempts, "quality update gave up under contention");
        Err(MemoryError::Contention {
            id: id.to_string(),
            attempts,
        })
    }

    /// Delete vector rows whose fragment row is missing.
    pub fn sweep_orphans(&self) -> Result<Vec<FragmentId>> {
        let orphans = self.write(|tx| {
            let orphans: Vec<FragmentId> = {
                let mut stmt = tx.prepare(
                    "SELECT v.id FROM fragments_vec v \
                     WHERE NOT EXISTS (SELECT 1 FROM fragments f WHERE f.id = v.id)",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            for id in &orphans {
                tx.execute("DELETE FROM fragments_vec WHERE id = ?1", params![id])?;
                write_log(tx, "orphan_sweep", id, None)?;
            }
            Ok(orphans)
        })?;

        if !orphans.is_empty() {
            tracing::warn!(count = orphans.len(), "removed orphaned vector rows");
            self.evict(&orphans);
        }
        Ok(orphans)
    }

    /// Quality history, oldest first.
    pub fn snapshots(&self, id: &str) -> Result<Vec<QualitySnapshot>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT version, quality_score, reason, created_at FROM quality_snapshots \
                 WHERE fragment_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                Ok(QualitySnapshot {
                    version: row.get(0)?,
                    quality_score: row.get(1)?,
                    reason: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Audit log entries for a fragment, oldest first.
    pub fn audit_log(&self, id: &str) -> Result<Vec<LogEntry>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT operation, details, created_at FROM fragment_log \
                 WHERE fragment_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                let details: Option<String> = row.get(1)?;
                Ok(LogEntry {
                    operation: row.get(0)?,
                    details: details.and_then(|d| serde_json::from_str(&d).ok()),
                    created_at: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

pub(crate) fn insert_fragment(tx: &Transaction<'_>, f: &MemoryFragment, embedding: &[f32]) -> Result<()> {
    let created = ts(&f.temporal.created_at);

    tx.execute(
        "INSERT OR IGNORE INTO agent_types (key, created_at) VALUES (?1, ?2)",
        params![f.agent_type, created],
    )?;
    for contributor in &f.contributors {
        register_instance(tx, contributor, &f.agent_type, &f.temporal.created_at)?;
    }

    let fingerprint_digest = f.fingerprint.digest();
    tx.execute(
        "INSERT OR IGNORE INTO context_fingerprints (digest, body, created_at) VALUES (?1, ?2, ?3)",
        params![fingerprint_digest, serde_json::to_string(&f.fingerprint)?, created],
    )?;

    if let Some(target) = &f.replaces {
        let owner: Option<String> = tx
            .query_row(
                "SELECT agent_type FROM fragments WHERE id = ?1",
                params![target],
                |row| row.get(0),
            )
            .optional()?;
        match owner {
            None => {
                return Err(MemoryError::Validation(format!(
                    "replaces unknown fragment {target}"
                )))
            }
            Some(owner) if owner != f.agent_type => {
                return Err(MemoryError::Validation(format!(
                    "fragment {target} belongs to agent type {owner}"
                )))
            }
            Some(_) => {}
        }
    }

    tx.execute(
        "INSERT INTO fragments (id, agent_type, kind, content, content_digest, fingerprint_digest, \
             scope, project_id, cross_type_refs, quality_score, quality_scores, validation_count, \
             application_count, success_rate, last_used_at, created_at, last_validated_at, \
             valid_from, valid_until, deprecated_at, archived_at, superseded_by, replaces, version) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, \
             ?19, ?20, ?21, ?22, ?23, ?24)",
        params![
            f.id,
            f.agent_type,
            f.kind.as_str(),
            serde_json::to_string(&f.content)?,
            f.content.digest()?,
            fingerprint_digest,
            f.scope.as_str(),
            f.scope.project_id(),
            serde_json::to_string(&f.cross_type_refs)?,
            f.quality_score,
            serde_json::to_string(&f.quality)?,
            f.usage.validation_count,
            f.usage.application_count,
            f.usage.success_rate,
            f.usage.last_used_at.as_ref().map(ts),
            created,
            ts(&f.temporal.last_validated_at),
            ts(&f.temporal.valid_from),
            f.temporal.valid_until.as_ref().map(ts),
            f.temporal.deprecated_at.as_ref().map(ts),
            f.archived_at.as_ref().map(ts),
            f.superseded_by,
            f.replaces,
            f.version,
        ],
    )?;

    insert_edge(tx, EdgeType::Owns, &f.agent_type, &f.id, None, &f.temporal.created_at)?;
    for contributor in &f.contributors {
        insert_edge(tx, EdgeType::ContributedBy, &f.id, contributor, None, &f.temporal.created_at)?;
    }
    insert_edge(tx, EdgeType::AppliesIn, &f.id, &fingerprint_digest, None, &f.temporal.created_at)?;
    if let Some(project) = f.scope.project_id() {
        insert_edge(tx, EdgeType::ScopedTo, &f.id, project, None, &f.temporal.created_at)?;
    }

    tx.execute(
        "INSERT INTO fragments_vec (id, embedding) VALUES (?1, ?2)",
        params![f.id, embedding_to_bytes(embedding)],
    )?;

    insert_snapshot(tx, &f.id, f.version, f.quality_score, &f.quality, "create")?;
    write_log(
        tx,
        "create",
        &f.id,
        Some(&serde_json::json!({
            "agent_type": f.agent_type,
            "kind": f.kind.as_str(),
            "contributors": f.contributors,
        })),
    )?;
    Ok(())
}

/// Raw column values of one fragment row, before structural validation.
struct FragmentRow {
    id: String,
    agent_type: String,
    kind: String,
    content: String,
    content_digest: String,
    fingerprint_digest: String,
    fingerprint_body: Option<String>,
    scope: String,
    project_id: Option<String>,
    cross_type_refs: String,
    quality_score: f64,
    quality_scores: String,
    validation_count: i64,
    application_count: i64,
    success_rate: f64,
    last_used_at: Option<String>,
    created_at: String,
    last_validated_at: String,
    valid_from: String,
    valid_until: Option<String>,
    deprecated_at: Option<String>,
    archived_at: Option<String>,
    superseded_by: Option<String>,
    replaces: Option<String>,
    version: i64,
}

impl FragmentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            agent_type: row.get(1)?,
            kind: row.get(2)?,
            content: row.get(3)?,
            content_digest: row.get(4)?,
            fingerprint_digest: row.get(5)?,
            fingerprint_body: row.get(6)?,
            scope: row.get(7)?,
            project_id: row.get(8)?,
            cross_type_refs: row.get(9)?,
            quality_score: row.get(10)?,
            quality_scores: row.get(11)?,
            validation_count: row.get(12)?,
            application_count: row.get(13)?,
            success_rate: row.get(14)?,
            last_used_at: row.get(15)?,
            created_at: row.get(16)?,
            last_validated_at: row.get(17)?,
            valid_from: row.get(18)?,
            valid_until: row.get(19)?,
            deprecated_at: row.get(20)?,
            archived_at: row.get(21)?,
            superseded_by: row.get(22)?,
            replaces: row.get(23)?,
            version: row.get(24)?,
        })
    }

    /// Structural validation. Any failure names the offending field.
    fn decode(self) -> std::result::Result<MemoryFragment, String> {
        let kind = self.kind.parse()?;
        let content: FragmentContent =
            serde_json::from_str(&self.content).map_err(|e| format!("content: {e}"))?;
        let digest = content.digest().map_err(|e| format!("content digest: {e}"))?;
        if digest != self.content_digest {
            return Err("content digest mismatch".into());
        }

        let fingerprint = decode_fingerprint(self.fingerprint_body.as_deref())?;
        if fingerprint.digest() != self.fingerprint_digest {
            return Err("fingerprint digest mismatch".into());
        }

        let quality: QualityScores = serde_json::from_str(&self.quality_scores)
            .map_err(|e| format!("quality_scores: {e}"))?;
        if !self.quality_score.is_finite() || !(0.0..=1.0).contains(&self.quality_score) {
            return Err(format!("quality_score out of range: {}", self.quality_score));
        }
        let cross_type_refs: Vec<FragmentId> = serde_json::from_str(&self.cross_type_refs)
            .map_err(|e| format!("cross_type_refs: {e}"))?;

        let count = |name: &str, v: i64| u32::try_from(v).map_err(|_| format!("{name} out of range: {v}"));

        Ok(MemoryFragment {
            id: self.id,
            agent_type: self.agent_type,
            kind,
            content,
            quality_score: self.quality_score,
            quality,
            fingerprint,
            usage: UsageStats {
                validation_count: count("validation_count", self.validation_count)?,
                application_count: count("application_count", self.application_count)?,
                success_rate: self.success_rate,
                last_used_at: optional_ts("last_used_at", self.last_used_at)?,
            },
            contributors: Vec::new(),
            temporal: TemporalMetadata {
                created_at: required_ts("created_at", &self.created_at)?,
                last_validated_at: required_ts("last_validated_at", &self.last_validated_at)?,
                valid_from: required_ts("valid_from", &self.valid_from)?,
                valid_until: optional_ts("valid_until", self.valid_until)?,
                deprecated_at: optional_ts("deprecated_at", self.deprecated_at)?,
            },
            supersedes: Vec::new(),
            superseded_by: self.superseded_by,
            replaces: self.replaces,
            conflicts: Vec::new(),
            scope: Scope::from_parts(&self.scope, self.project_id)?,
            cross_type_refs,
            archived_at: optional_ts("archived_at", self.archived_at)?,
            version: self.version,
        })
    }
}

/// Columns the structural filter needs, without the fragment body.
struct StructureRow {
    agent_type: String,
    scope: String,
    project_id: Option<String>,
    fingerprint_body: Option<String>,
    created_at: String,
    last_validated_at: String,
    valid_from: String,
    valid_until: Option<String>,
    deprecated_at: Option<String>,
    archived_at: Option<String>,
    superseded_by: Option<String>,
}

struct Shape {
    scope: Scope,
    fingerprint: ContextFingerprint,
    temporal: TemporalMetadata,
    archived: bool,
    superseded: bool,
}

impl StructureRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            agent_type: row.get(0)?,
            scope: row.get(1)?,
            project_id: row.get(2)?,
            fingerprint_body: row.get(3)?,
            created_at: row.get(4)?,
            last_validated_at: row.get(5)?,
            valid_from: row.get(6)?,
            valid_until: row.get(7)?,
            deprecated_at: row.get(8)?,
            archived_at: row.get(9)?,
            superseded_by: row.get(10)?,
        })
    }

    fn decode(self) -> std::result::Result<Shape, String> {
        Ok(Shape {
            scope: Scope::from_parts(&self.scope, self.project_id)?,
            fingerprint: decode_fingerprint(self.fingerprint_body.as_deref())?,
            temporal: TemporalMetadata {
                created_at: required_ts("created_at", &self.created_at)?,
                last_validated_at: required_ts("last_validated_at", &self.last_validated_at)?,
                valid_from: required_ts("valid_from", &self.valid_from)?,
                valid_until: optional_ts("valid_until", self.valid_until)?,
                deprecated_at: optional_ts("deprecated_at", self.deprecated_at)?,
            },
            archived: self.archived_at.is_some(),
            superseded: self.superseded_by.is_some(),
        })
    }
}

fn decode_fingerprint(body: Option<&str>) -> std::result::Result<ContextFingerprint, String> {
    let body = body.ok_or("missing context fingerprint")?;
    serde_json::from_str(body).map_err(|e| format!("fingerprint: {e}"))
}

fn required_ts(name: &str, value: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_ts(value).ok_or_else(|| format!("{name} is not a timestamp: {value}"))
}

fn optional_ts(name: &str, value: Option<String>) -> std::result::Result<Option<DateTime<Utc>>, String> {
    value.map(|v| required_ts(name, &v)).transpose()
}

/// Load and validate one fragment with its edges. `Ok(None)` when absent.
pub(crate) fn load_fragment(conn: &Connection, id: &str) -> Result<Option<MemoryFragment>> {
    let sql = format!(
        "SELECT {FRAGMENT_COLUMNS} FROM fragments f \
         LEFT JOIN context_fingerprints cf ON cf.digest = f.fingerprint_digest \
         WHERE f.id = ?1"
    );
    let Some(row) = conn
        .query_row(&sql, params![id], FragmentRow::from_row)
        .optional()?
    else {
        return Ok(None);
    };

    let mut fragment = row.decode().map_err(|reason| MemoryError::Corrupted {
        id: id.to_string(),
        reason,
    })?;

    fragment.contributors = {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT dst_id FROM graph_edges \
             WHERE edge_type = 'CONTRIBUTED_BY' AND src_id = ?1 ORDER BY dst_id",
        )?;
        let rows = stmt.query_map(params![id], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()?
    };
    if fragment.contributors.is_empty() {
        return Err(MemoryError::Corrupted {
            id: id.to_string(),
            reason: "no contributors".into(),
        });
    }

    fragment.supersedes = {
        let mut stmt =
            conn.prepare("SELECT id FROM fragments WHERE superseded_by = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![id], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()?
    };

    fragment.conflicts = {
        let mut stmt = conn.prepare(
            "SELECT id, fragment_a, fragment_b, conflict_type, status FROM conflicts \
             WHERE fragment_a = ?1 OR fragment_b = ?1 ORDER BY detected_at, id",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut links = Vec::new();
        for row in rows {
            let (conflict_id, a, b, conflict_type, status) = row?;
            let corrupted = |reason: String| MemoryError::Corrupted {
                id: id.to_string(),
                reason,
            };
            links.push(ConflictLink {
                conflict_id,
                other: if a == id { b } else { a },
                conflict_type: conflict_type.parse().map_err(corrupted)?,
                status: status.parse().map_err(corrupted)?,
            });
        }
        links
    };

    Ok(Some(fragment))
}

/// Register an agent instance under its agent type on first sight.
pub(crate) fn register_instance(
    conn: &Connection,
    instance_id: &str,
    agent_type: &str,
    now: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO agent_types (key, created_at) VALUES (?1, ?2)",
        params![agent_type, ts(now)],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO agent_instances (id, agent_type, first_seen_at) VALUES (?1, ?2, ?3)",
        params![instance_id, agent_type, ts(now)],
    )?;
    Ok(())
}

pub(crate) fn insert_edge(
    conn: &Connection,
    edge: EdgeType,
    src: &str,
    dst: &str,
    reason: Option<&str>,
    at: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO graph_edges (edge_type, src_id, dst_id, reason, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![edge.as_str(), src, dst, reason, ts(at)],
    )?;
    Ok(())
}

pub(crate) fn insert_snapshot(
    conn: &Connection,
    fragment_id: &str,
    version: i64,
    quality_score: f64,
    quality: &QualityScores,
    reason: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO quality_snapshots (fragment_id, version, quality_score, quality_scores, reason, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            fragment_id,
            version,
            quality_score,
            serde_json::to_string(quality)?,
            reason,
            ts(&Utc::now()),
        ],
    )?;
    Ok(())
}

/// Append to the `fragment_log` audit table.
pub(crate) fn write_log(
    conn: &Connection,
    operation: &str,
    fragment_id: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO fragment_log (operation, fragment_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            operation,
            fragment_id,
            details.map(|d| d.to_string()),
            ts(&Utc::now()),
        ],
    )?;
    Ok(())
}

/// Current supersession links of an agent type: superseder -> superseded.
pub(crate) fn supersession_adjacency(
    conn: &Connection,
    agent_type: &str,
) -> Result<HashMap<FragmentId, Vec<FragmentId>>> {
    let mut stmt = conn.prepare(
        "SELECT superseded_by, id FROM fragments \
         WHERE agent_type = ?1 AND superseded_by IS NOT NULL",
    )?;
    let rows = stmt.query_map(params![agent_type], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut adjacency: HashMap<FragmentId, Vec<FragmentId>> = HashMap::new();
    for row in rows {
        let (newer, older) = row?;
        adjacency.entry(newer).or_default().push(older);
    }
    Ok(adjacency)
}

/// Whether `to` is reachable from `from` along the adjacency lists.
pub(crate) fn reachable(adjacency: &HashMap<FragmentId, Vec<FragmentId>>, from: &str, to: &str) -> bool {
    let mut stack = vec![from.to_string()];
    let mut seen = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if !seen.insert(node.clone()) {
            continue;
        }
        if let Some(next) = adjacency.get(&node) {
            stack.extend(next.iter().cloned());
        }
    }
    false
}

/// Ids of fragments not archived or superseded, optionally for one agent type.
pub(crate) fn live_fragment_ids(conn: &Connection, agent_type: Option<&str>) -> Result<Vec<FragmentId>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM fragments \
         WHERE archived_at IS NULL AND superseded_by IS NULL \
           AND (?1 IS NULL OR agent_type = ?1) \
         ORDER BY id",
    )?;
    let rows = stmt.query_map(params![agent_type], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Cutoff helper shared by sweeps: `now - days`.
pub(crate) fn days_before(now: &DateTime<Utc>, days: i64) -> String {
    ts(&(*now - Duration::days(days)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemporalConfig;
    use crate::memory::types::{now, KnowledgeKind};

    fn store() -> HybridStore {
        HybridStore::new(crate::db::open_memory_database().unwrap(), 16)
    }

    fn spike(dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[dim] = 1.0;
        v
    }

    fn python() -> ContextFingerprint {
        ContextFingerprint::builder().technologies(["python", "sync"]).build()
    }

    fn fragment(id: &str, pattern: &str) -> MemoryFragment {
        let t = now();
        MemoryFragment {
            id: id.into(),
            agent_type: "architect".into(),
            kind: KnowledgeKind::Procedural,
            content: FragmentContent::new(pattern, "because").with_situation("error handling"),
            quality_score: 0.7,
            quality: QualityScores {
                confidence: 0.7,
                validation: 0.0,
                recency: 1.0,
                consensus: 0.25,
                context_specificity: 0.2,
                impact: 0.5,
            },
            fingerprint: python(),
            usage: UsageStats::default(),
            contributors: vec!["architect-1".into()],
            temporal: TemporalMetadata {
                created_at: t,
                last_validated_at: t,
                valid_from: t,
                valid_until: None,
                deprecated_at: None,
            },
            supersedes: vec![],
            superseded_by: None,
            replaces: None,
            conflicts: vec![],
            scope: Scope::Contextual,
            cross_type_refs: vec![],
            archived_at: None,
            version: 1,
        }
    }

    fn query<'a>(context: &'a ContextFingerprint) -> StructuralQuery<'a> {
        StructuralQuery {
            agent_type: "architect",
            context,
            project_id: None,
            validity_at: now(),
            include_historical: false,
            similarity_threshold: 0.5,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = store();
        let f = fragment("f1", "use result types");
        store.put(&f, &spike(0)).unwrap();

        assert_eq!(store.get("f1").unwrap(), f);
        assert_eq!(store.get_fresh("f1").unwrap(), f);
    }

    #[test]
    fn failed_put_leaves_no_trace() {
        let store = store();
        let f = fragment("f1", "use result types");
        store.put(&f, &spike(0)).unwrap();

        // same id again: the graph insert fails, so the vector insert must roll back too
        let mut dup = fragment("f1", "different");
        dup.contributors = vec!["architect-2".into()];
        assert!(store.put(&dup, &spike(1)).is_err());

        let vectors: i64 = store
            .read(|c| Ok(c.query_row("SELECT COUNT(*) FROM fragments_vec", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(vectors, 1);
        assert_eq!(store.get("f1").unwrap().content.pattern, "use result types");
    }

    #[test]
    fn wrong_embedding_size_is_rejected() {
        let store = store();
        let err = store.put(&fragment("f1", "p"), &[1.0, 0.0]).unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[test]
    fn missing_fragment_is_not_found() {
        assert!(matches!(store().get("nope"), Err(MemoryError::NotFound(_))));
    }

    #[test]
    fn tampered_content_reads_as_corrupted() {
        let store = store();
        store.put(&fragment("f1", "use result types"), &spike(0)).unwrap();
        store
            .write(|tx| {
                tx.execute(
                    "UPDATE fragments SET content = '{\"pattern\":\"x\",\"reasoning\":\"y\"}' WHERE id = 'f1'",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let err = store.get_fresh("f1").unwrap_err();
        assert!(matches!(err, MemoryError::Corrupted { ref reason, .. } if reason.contains("digest")));
    }

    #[test]
    fn candidates_come_back_nearest_first() {
        let store = store();
        store.put(&fragment("f1", "a"), &spike(0)).unwrap();
        store.put(&fragment("f2", "b"), &spike(1)).unwrap();

        let hits = store.candidates_by_embedding(&spike(1), "architect", 2).unwrap();
        assert_eq!(hits[0].id, "f2");
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        assert!(hits[1].similarity.abs() < 1e-6);
        assert!(store.candidates_by_embedding(&spike(1), "architect", 0).unwrap().is_empty());
        assert!(store.candidates_by_embedding(&spike(1), "reviewer", 2).unwrap().is_empty());
    }

    #[test]
    fn busy_neighbour_type_does_not_crowd_out_candidates() {
        let store = store();
        for i in 0..60 {
            let mut noisy = fragment(&format!("r{i:02}"), &format!("review rule {i}"));
            noisy.agent_type = "reviewer".into();
            store.put(&noisy, &spike(0)).unwrap();
        }
        let mut mine = spike(0);
        mine[1] = 0.5;
        store.put(&fragment("mine", "a"), &crate::embedding::l2_normalize(&mine)).unwrap();

        let hits = store.candidates_by_embedding(&spike(0), "architect", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "mine");

        let reviewers = store.candidates_by_embedding(&spike(0), "reviewer", 10).unwrap();
        assert_eq!(reviewers.len(), 10);
    }

    #[test]
    fn structural_filter_applies_type_context_and_validity() {
        let store = store();
        let temporal = TemporalManager::new(&TemporalConfig::default());

        store.put(&fragment("ok", "a"), &spike(0)).unwrap();

        let mut other_type = fragment("other", "b");
        other_type.agent_type = "reviewer".into();
        store.put(&other_type, &spike(0)).unwrap();

        let mut elsewhere = fragment("elsewhere", "c");
        elsewhere.fingerprint = ContextFingerprint::builder().technologies(["go"]).build();
        store.put(&elsewhere, &spike(0)).unwrap();

        let mut expired = fragment("expired", "d");
        expired.temporal.valid_until = Some(now() - Duration::days(1));
        expired.temporal.valid_from = now() - Duration::days(5);
        store.put(&expired, &spike(0)).unwrap();

        let mut universal = fragment("universal", "e");
        universal.scope = Scope::Universal;
        universal.fingerprint = ContextFingerprint::default();
        store.put(&universal, &spike(0)).unwrap();

        let mut project = fragment("project", "f");
        project.scope = Scope::Project("cairn".into());
        store.put(&project, &spike(0)).unwrap();

        let ids: Vec<FragmentId> = ["ok", "other", "elsewhere", "expired", "universal", "project", "ghost"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let ctx = python();

        let result = store.filter_by_structure(&ids, &query(&ctx), &temporal).unwrap();
        let kept: Vec<&str> = result.matches.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(kept, vec!["ok", "universal"]);
        assert!(result.corrupted.is_empty());

        let mut in_project = query(&ctx);
        in_project.project_id = Some("cairn");
        in_project.include_historical = true;
        let result = store.filter_by_structure(&ids, &in_project, &temporal).unwrap();
        let kept: Vec<&str> = result.matches.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(kept, vec!["ok", "expired", "universal", "project"]);
    }

    #[test]
    fn quality_update_bumps_version_and_snapshots() {
        let store = store();
        let f = fragment("f1", "a");
        store.put(&f, &spike(0)).unwrap();

        let updated = store
            .update_quality("f1", 3, |current| {
                Some(QualityUpdate {
                    quality_score: 0.8,
                    quality: current.quality,
                    usage: current.usage.clone(),
                    last_validated_at: current.temporal.last_validated_at,
                    reason: "feedback",
                })
            })
            .unwrap()
            .unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.quality_score, 0.8);
        assert_eq!(updated.content, f.content);
        let snaps = store.snapshots("f1").unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[1].reason, "feedback");
    }

    #[test]
    fn quality_update_reports_contention() {
        let store = store();
        store.put(&fragment("f1", "a"), &spike(0)).unwrap();

        let err = store
            .update_quality("f1", 3, |current| {
                // a concurrent writer moves the version between read and write
                store
                    .write(|tx| {
                        tx.execute("UPDATE fragments SET version = version + 1 WHERE id = 'f1'", [])?;
                        Ok(())
                    })
                    .unwrap();
                Some(QualityUpdate {
                    quality_score: 0.1,
                    quality: current.quality,
                    usage: current.usage.clone(),
                    last_validated_at: current.temporal.last_validated_at,
                    reason: "feedback",
                })
            })
            .unwrap_err();

        assert!(matches!(err, MemoryError::Contention { attempts: 3, .. }));
        assert_eq!(store.get_fresh("f1").unwrap().quality_score, 0.7);
    }

    #[test]
    fn orphaned_vectors_are_swept() {
        let store = store();
        store.put(&fragment("f1", "a"), &spike(0)).unwrap();
        store
            .write(|tx| {
                tx.execute(
                    "INSERT INTO fragments_vec (id, embedding) VALUES ('ghost', ?1)",
                    params![embedding_to_bytes(&spike(3))],
                )?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.sweep_orphans().unwrap(), vec!["ghost".to_string()]);
        assert!(store.sweep_orphans().unwrap().is_empty());
    }

    #[test]
    fn cache_is_bounded() {
        let store = HybridStore::new(crate::db::open_memory_database().unwrap(), 2);
        for (i, id) in ["f1", "f2", "f3"].iter().enumerate() {
            store.put(&fragment(id, "p"), &spike(i)).unwrap();
        }
        assert_eq!(store.cached_len(), 2);
        // evicted entries still load from the graph
        assert_eq!(store.get("f1").unwrap().id, "f1");
    }

    #[test]
    fn reachability_follows_links() {
        let mut adjacency = HashMap::new();
        adjacency.insert("a".to_string(), vec!["b".to_string()]);
        adjacency.insert("b".to_string(), vec!["c".to_string()]);
        assert!(reachable(&adjacency, "a", "c"));
        assert!(!reachable(&adjacency, "c", "a"));
    }
}
