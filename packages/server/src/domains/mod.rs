// Business domains
pub mod hardware;
