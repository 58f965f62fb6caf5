use serde::{Deserialize, Serialize};

/// The single record type served by Userfront.
///
/// A user is addressable by `id` (generated by storage on create) and by
/// `nickname` (unique). Field names on the wire follow the public API:
/// `firstname`, `lastname` and `pass`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: i64,
    pub nickname: String,
    #[serde(rename = "firstname", default)]
    pub first_name: String,
    #[serde(rename = "lastname", default)]
    pub last_name: String,
    #[serde(default)]
    pub gender: String,
    #[serde(rename = "pass", default)]
    pub password: String,
    #[serde(default)]
    pub status: i16,
}

impl User {
    /// Creates a user that has not been stored yet (id 0).
    pub fn new(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = first.into();
        self.last_name = last.into();
        self
    }

    #[must_use]
    pub fn with_gender(mut self, gender: impl Into<String>) -> Self {
        self.gender = gender.into();
        self
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: i16) -> Self {
        self.status = status;
        self
    }

    /// Returns `true` once storage has assigned an id.
    pub fn is_persisted(&self) -> bool {
        self.id > 0
    }
}
