pub mod connection;
pub mod id;
pub mod user;

pub use connection::{
    ConnectError, ConnectionSlot, KeepAlive, KeepAliveConfig, Redial, dial_into, probe_slot,
};
pub use id::{IdError, parse_user_id};
pub use user::User;
