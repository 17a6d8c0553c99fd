pub mod account;
pub mod chat;
pub mod order;
