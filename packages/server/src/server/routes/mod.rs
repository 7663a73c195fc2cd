// HTTP routes
pub mod hardware;
pub mod health;
pub mod status;

pub use hardware::*;
pub use health::*;
pub use status::*;
