pub mod amount_repository;
pub mod cursor_repository;
pub mod files;
pub mod refunded_repository;

pub use amount_repository::AmountRepository;
pub use cursor_repository::CursorRepository;
pub use refunded_repository::RefundedRepository;
