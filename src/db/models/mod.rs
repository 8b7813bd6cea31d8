pub mod agent;
pub mod healing;
pub mod heartbeat;
pub mod pattern;
pub mod suggestion;

pub use agent::*;
pub use healing::*;
pub use heartbeat::*;
pub use pattern::*;
pub use suggestion::*;
