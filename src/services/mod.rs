pub mod executor;
pub mod parser;
pub mod poller;
pub mod ssh;
pub mod store;
