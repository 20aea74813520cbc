//! Beamdrop relay server library.
//!
//! A clustered relay for browser-to-browser file sharing: two clients
//! meet in a share session and the server fans the sender's chunk stream
//! out to the other participant in near real time. One instance works
//! standalone on the embedded backend; multiple instances coordinate
//! through a shared redis store and its pub/sub fabric, so the two peers
//! of a session may be connected to different nodes.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod http;
pub mod model;
pub mod protocol;
pub mod pubsub;
pub mod registry;
pub mod session;
pub mod state;
pub mod storage;
pub mod transfer;
