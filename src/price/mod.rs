pub mod cache;
pub mod crawler;

pub use cache::{PriceCache, PriceKind};
pub use crawler::{Crawler, Quote};
