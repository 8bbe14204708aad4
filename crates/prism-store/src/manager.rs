//! Session state manager.
//!
//! Owns the database allocator and the metadata keyspace. Lesson data lives in
//! databases 1-15; database 0 holds one JSON [`LessonStateMetadata`] record per
//! saved lesson under `<namespace>:lesson:state:<lessonId>`.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::allocator::{is_lesson_database, DatabaseAllocator, LESSON_DB_END, LESSON_DB_START};
use crate::store::StateStore;
use crate::{Result, StoreError};

/// Namespace used for metadata keys when none is configured.
pub const DEFAULT_NAMESPACE: &str = "prism";

/// The persisted record of a saved lesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonStateMetadata {
    /// Stable lesson id; also the key suffix.
    pub lesson_id: String,
    /// Topic as displayed when the lesson was saved.
    pub lesson_topic: String,
    /// Lesson database holding the learner's data.
    pub database: u8,
    /// When the record was written.
    pub saved_at: DateTime<Utc>,
    /// Session that saved the lesson.
    pub session_id: String,
}

/// Allocates lesson databases and manages saved-lesson metadata.
///
/// The manager never flushes on its own; callers decide when a database is
/// discarded via [`flush_database`](Self::flush_database).
pub struct SessionStateManager {
    store: Arc<dyn StateStore>,
    allocator: DatabaseAllocator,
    namespace: String,
}

impl std::fmt::Debug for SessionStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStateManager")
            .field("allocator", &self.allocator)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl SessionStateManager {
    /// Creates a manager over `store`, taking ownership of `allocator`.
    pub fn new(
        store: Arc<dyn StateStore>,
        allocator: DatabaseAllocator,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            allocator,
            namespace: namespace.into(),
        }
    }

    /// Returns the metadata key for `lesson_id`.
    #[must_use]
    pub fn state_key(&self, lesson_id: &str) -> String {
        format!("{}{lesson_id}", self.key_prefix())
    }

    fn key_prefix(&self) -> String {
        format!("{}:lesson:state:", self.namespace)
    }

    /// Hands out the next lesson database.
    pub fn allocate_database(&self) -> u8 {
        let db = self.allocator.allocate();
        debug!(database = db, "Allocated lesson database");
        db
    }

    /// Hands out the next lesson database that no saved lesson claims.
    ///
    /// The allocator lives in one process while saved records outlive it, so
    /// databases named by saved metadata are skipped. When every lesson
    /// database is claimed, the database after a full lap is returned.
    pub async fn allocate_unclaimed_database(&self) -> Result<u8> {
        let claimed: HashSet<u8> = self
            .get_all_saved_lessons()
            .await?
            .into_iter()
            .map(|lesson| lesson.database)
            .collect();

        let mut db = self.allocate_database();
        for _ in LESSON_DB_START..LESSON_DB_END {
            if !claimed.contains(&db) {
                return Ok(db);
            }
            debug!(database = db, "Database claimed by a saved lesson, skipping");
            db = self.allocate_database();
        }
        if claimed.contains(&db) {
            warn!(database = db, "Every lesson database is claimed by a saved lesson");
        }
        Ok(db)
    }

    /// Returns the saved database for `lesson_id`, or allocates an unclaimed
    /// one when nothing is saved.
    pub async fn get_database_for_lesson(&self, lesson_id: &str) -> Result<u8> {
        match self.get_lesson_state(lesson_id).await? {
            Some(state) if is_lesson_database(state.database) => {
                debug!(lesson_id, database = state.database, "Reusing saved database");
                Ok(state.database)
            }
            Some(state) => {
                warn!(
                    lesson_id,
                    database = state.database,
                    "Saved state points outside lesson range, allocating a new database"
                );
                self.allocate_unclaimed_database().await
            }
            None => self.allocate_unclaimed_database().await,
        }
    }

    /// Reads the saved record for `lesson_id`.
    pub async fn get_lesson_state(&self, lesson_id: &str) -> Result<Option<LessonStateMetadata>> {
        let Some(raw) = self.store.get(&self.state_key(lesson_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Persists metadata for a lesson, replacing any previous record.
    pub async fn save_lesson_state(
        &self,
        lesson_id: &str,
        lesson_topic: &str,
        database: u8,
        session_id: &str,
    ) -> Result<LessonStateMetadata> {
        if !is_lesson_database(database) {
            return Err(StoreError::InvalidDatabase(database));
        }

        let metadata = LessonStateMetadata {
            lesson_id: lesson_id.to_string(),
            lesson_topic: lesson_topic.to_string(),
            database,
            saved_at: Utc::now(),
            session_id: session_id.to_string(),
        };
        let raw = serde_json::to_string(&metadata)?;
        self.store.set(&self.state_key(lesson_id), &raw).await?;

        info!(lesson_id, database, "Saved lesson state");
        Ok(metadata)
    }

    /// Deletes the metadata for `lesson_id`. The lesson database is untouched.
    pub async fn clear_lesson_state(&self, lesson_id: &str) -> Result<()> {
        self.store.delete(&self.state_key(lesson_id)).await?;
        info!(lesson_id, "Cleared lesson state");
        Ok(())
    }

    /// Returns `true` if metadata exists for `lesson_id`.
    pub async fn check_lesson_has_state(&self, lesson_id: &str) -> Result<bool> {
        self.store.exists(&self.state_key(lesson_id)).await
    }

    /// Lists every saved lesson, most recently saved first.
    ///
    /// Records that fail to decode are skipped with a warning.
    pub async fn get_all_saved_lessons(&self) -> Result<Vec<LessonStateMetadata>> {
        let keys = self.store.keys_with_prefix(&self.key_prefix()).await?;

        let mut lessons = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<LessonStateMetadata>(&raw) {
                Ok(metadata) => lessons.push(metadata),
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable lesson state"),
            }
        }
        lessons.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(lessons)
    }

    /// Clears every key in lesson database `database`.
    pub async fn flush_database(&self, database: u8) -> Result<()> {
        if !is_lesson_database(database) {
            return Err(StoreError::InvalidDatabase(database));
        }
        self.store.flush_database(database).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::allocator::METADATA_DB;
    use crate::store::MemoryStateStore;

    fn manager() -> (SessionStateManager, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let manager =
            SessionStateManager::new(store.clone(), DatabaseAllocator::new(), DEFAULT_NAMESPACE);
        (manager, store)
    }

    #[test]
    fn test_state_key_format() {
        let (manager, _) = manager();
        assert_eq!(
            manager.state_key("lesson-abc"),
            "prism:lesson:state:lesson-abc"
        );
    }

    #[test]
    fn test_metadata_serializes_camel_case() {
        let metadata = LessonStateMetadata {
            lesson_id: "hashes-101".to_string(),
            lesson_topic: "Redis Hashes".to_string(),
            database: 3,
            saved_at: Utc::now(),
            session_id: "s-1".to_string(),
        };
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["lessonId"], "hashes-101");
        assert_eq!(json["lessonTopic"], "Redis Hashes");
        assert_eq!(json["database"], 3);
        assert_eq!(json["sessionId"], "s-1");
        assert!(json["savedAt"].is_string());
    }

    #[tokio::test]
    async fn test_save_and_read_back() {
        let (manager, _) = manager();
        manager
            .save_lesson_state("hashes-101", "Redis Hashes", 4, "s-1")
            .await
            .unwrap();

        assert!(manager.check_lesson_has_state("hashes-101").await.unwrap());
        let state = manager.get_lesson_state("hashes-101").await.unwrap().unwrap();
        assert_eq!(state.database, 4);
        assert_eq!(state.lesson_topic, "Redis Hashes");
        assert_eq!(manager.get_database_for_lesson("hashes-101").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_unsaved_lesson_allocates() {
        let (manager, _) = manager();
        assert_eq!(manager.get_database_for_lesson("new").await.unwrap(), 1);
        assert_eq!(manager.get_database_for_lesson("other").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_new_process_skips_saved_databases() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let first = SessionStateManager::new(
            Arc::clone(&store),
            DatabaseAllocator::new(),
            DEFAULT_NAMESPACE,
        );
        let db_a = first.get_database_for_lesson("lesson-a").await.unwrap();
        first
            .save_lesson_state("lesson-a", "A", db_a, "s-1")
            .await
            .unwrap();

        let second = SessionStateManager::new(store, DatabaseAllocator::new(), DEFAULT_NAMESPACE);
        let db_b = second.get_database_for_lesson("lesson-b").await.unwrap();
        assert_eq!(db_a, 1);
        assert_eq!(db_b, 2);
    }

    #[tokio::test]
    async fn test_all_databases_claimed_falls_back_to_round_robin() {
        let (manager, _) = manager();
        for db in LESSON_DB_START..=LESSON_DB_END {
            manager
                .save_lesson_state(&format!("lesson-{db}"), "L", db, "s")
                .await
                .unwrap();
        }
        assert_eq!(manager.allocate_unclaimed_database().await.unwrap(), 15);
    }

    #[tokio::test]
    async fn test_save_rejects_metadata_database() {
        let (manager, _) = manager();
        let err = manager
            .save_lesson_state("x", "X", METADATA_DB, "s")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidDatabase(0)));

        let err = manager.flush_database(16).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidDatabase(16)));
    }

    #[tokio::test]
    async fn test_discard_flushes_and_clears() {
        let (manager, store) = manager();
        let db = manager.allocate_database();
        store.insert_into(db, "user:1", "Max").await;
        manager
            .save_lesson_state("lesson-a", "A", db, "s-1")
            .await
            .unwrap();

        manager.flush_database(db).await.unwrap();
        manager.clear_lesson_state("lesson-a").await.unwrap();

        assert_eq!(store.database_len(db).await, 0);
        assert!(!manager.check_lesson_has_state("lesson-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_all_saved_lessons_skips_garbage() {
        let (manager, store) = manager();
        manager.save_lesson_state("a", "A", 1, "s").await.unwrap();
        manager.save_lesson_state("b", "B", 2, "s").await.unwrap();
        store
            .set("prism:lesson:state:broken", "not json")
            .await
            .unwrap();

        let lessons = manager.get_all_saved_lessons().await.unwrap();
        let mut ids: Vec<_> = lessons.iter().map(|l| l.lesson_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
