pub mod check_use_case;
pub mod ports;

pub use check_use_case::{CheckUseCase, RunSummary};
