pub mod coordinator;
pub mod settle;
pub mod sync;
