pub mod frame;
pub mod session;

pub use session::{ChatEvent, ChatSession};
