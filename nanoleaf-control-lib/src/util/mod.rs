pub mod context;
pub mod retry;
pub mod traits;
