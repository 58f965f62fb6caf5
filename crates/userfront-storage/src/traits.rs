//! Storage traits for the user storage abstraction layer.

use async_trait::async_trait;
use userfront_core::User;

use crate::error::StorageError;

/// Durable CRUD for users.
///
/// Implementations must be thread-safe (`Send + Sync`) and must report a
/// broken backend connection as [`StorageError::Unavailable`] rather than
/// blocking the caller.
///
/// # Example
///
/// ```ignore
/// use userfront_storage::{StorageError, UserStorage};
///
/// async fn rename(storage: &dyn UserStorage, id: i64, nickname: &str) -> Result<(), StorageError> {
///     let mut user = storage.find_one(id).await?;
///     user.nickname = nickname.to_string();
///     storage.update(&user).await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait UserStorage: Send + Sync {
    // ==================== CRUD Operations ====================

    /// Inserts a user and writes the generated id back into `user`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if the nickname is taken.
    async fn create(&self, user: &mut User) -> Result<(), StorageError>;

    /// Reads a user by id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if no user has this id.
    async fn find_one(&self, id: i64) -> Result<User, StorageError>;

    /// Reads a user by its exact nickname.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if no user has this nickname.
    async fn find_one_by_nickname(&self, nickname: &str) -> Result<User, StorageError>;

    /// Returns at most `limit` users whose id is greater than `offset`,
    /// ordered by id.
    async fn find_all(&self, limit: i64, offset: i64) -> Result<Vec<User>, StorageError>;

    /// Overwrites the user with `user.id` and returns the record as it was
    /// before the update.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if zero rows were affected.
    async fn update(&self, user: &User) -> Result<User, StorageError>;

    /// Deletes a user by id and returns the deleted record.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if zero rows were affected.
    async fn delete(&self, id: i64) -> Result<User, StorageError>;

    // ==================== Lifecycle ====================

    /// Liveness probe for health checks. Never mutates state.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Releases the backend connection.
    async fn close(&self);

    /// Returns the name of this storage backend for logging.
    fn backend_name(&self) -> &'static str;
}
