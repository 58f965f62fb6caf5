//! In-memory user storage backend for Userfront.
//!
//! This crate provides an in-memory implementation of the `UserStorage`
//! trait from `userfront-storage`. It is the storage test double: besides
//! plain CRUD it can simulate an outage and counts the calls it receives.
//!
//! # Example
//!
//! ```ignore
//! use userfront_db_memory::InMemoryUserStorage;
//! use userfront_storage::{User, UserStorage};
//!
//! let storage = InMemoryUserStorage::new();
//! let mut ann = User::new("ann");
//! storage.create(&mut ann).await?;
//! assert_eq!(ann.id, 1);
//! ```

mod storage;

pub use storage::{CallCounts, InMemoryUserStorage};

// Re-export the storage trait for convenience
pub use userfront_storage::{StorageError, User, UserStorage};

/// Creates a new shareable in-memory storage.
pub fn create_user_storage() -> std::sync::Arc<InMemoryUserStorage> {
    std::sync::Arc::new(InMemoryUserStorage::new())
}
