pub mod chats;
pub mod client;
pub mod daemon;
pub mod send;
pub mod status;
