pub mod chain;
pub mod config;
pub mod errors;
pub mod events;
pub mod giveaway;
pub mod payout;
pub mod price;
pub mod query;
pub mod refunder;
pub mod repository;
pub mod rpc;
pub mod scanner;
pub mod ticker;
pub mod worker_pool;
