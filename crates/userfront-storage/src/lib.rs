//! # userfront-storage
//!
//! Storage abstraction layer for the Userfront server.
//!
//! This crate defines the [`UserStorage`] trait and [`StorageError`]. It does
//! not contain any implementations - those live in `userfront-db-postgres`
//! and `userfront-db-memory`.

mod error;
mod traits;

pub use error::{ErrorCategory, StorageError};
pub use traits::UserStorage;
pub use userfront_core::User;

/// Entity name used in storage errors.
pub const USER_ENTITY: &str = "user";

/// Type alias for a shareable storage instance.
pub type DynUserStorage = std::sync::Arc<dyn UserStorage>;
