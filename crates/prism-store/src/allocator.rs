//! Round-robin allocation of lesson databases.

use std::sync::atomic::{AtomicU8, Ordering};

/// Database reserved for lesson metadata. Never handed out to a lesson.
pub const METADATA_DB: u8 = 0;

/// First database that may be allocated to a lesson.
pub const LESSON_DB_START: u8 = 1;

/// Last database that may be allocated to a lesson.
pub const LESSON_DB_END: u8 = 15;

/// Hands out lesson databases in `LESSON_DB_START..=LESSON_DB_END`, wrapping
/// back to the start after the end.
///
/// One allocator belongs to one [`SessionStateManager`](crate::SessionStateManager).
/// Two allocators pointed at the same store will hand out overlapping
/// databases; running more than one is unsupported.
#[derive(Debug)]
pub struct DatabaseAllocator {
    last: AtomicU8,
}

impl Default for DatabaseAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseAllocator {
    /// Creates an allocator whose first allocation is `LESSON_DB_START`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last: AtomicU8::new(LESSON_DB_START - 1),
        }
    }

    /// Creates an allocator whose pointer already sits on `last`.
    ///
    /// The next allocation returns the database after `last`. Values past
    /// `LESSON_DB_END` are clamped to it.
    ///
    /// # Examples
    ///
    /// ```
    /// use prism_store::DatabaseAllocator;
    ///
    /// let allocator = DatabaseAllocator::starting_at(1);
    /// assert_eq!(allocator.allocate(), 2);
    /// ```
    #[must_use]
    pub fn starting_at(last: u8) -> Self {
        Self {
            last: AtomicU8::new(last.min(LESSON_DB_END)),
        }
    }

    /// Returns the next lesson database.
    pub fn allocate(&self) -> u8 {
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(next_after(last))
            });
        match previous {
            Ok(last) | Err(last) => next_after(last),
        }
    }

    /// Returns the most recently allocated database, or `None` before the
    /// first allocation.
    #[must_use]
    pub fn last_allocated(&self) -> Option<u8> {
        match self.last.load(Ordering::SeqCst) {
            METADATA_DB => None,
            db => Some(db),
        }
    }
}

/// Returns `true` if `db` may hold lesson data.
#[must_use]
pub const fn is_lesson_database(db: u8) -> bool {
    db >= LESSON_DB_START && db <= LESSON_DB_END
}

const fn next_after(last: u8) -> u8 {
    if last >= LESSON_DB_END {
        LESSON_DB_START
    } else {
        last + 1
    }
}
