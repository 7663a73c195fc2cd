// Hardware Value Server - API Core
//
// Periodically refreshes hardware listings through the tickwork reactor,
// ranks them by benchmark points per unit of price and serves the ranking
// over HTTP.

pub mod config;
pub mod domains;
pub mod server;

pub use config::*;
