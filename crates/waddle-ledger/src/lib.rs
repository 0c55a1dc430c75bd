pub mod accountant;
pub mod db;
pub mod error;
pub mod estimate;
pub mod rates;
pub mod types;

pub use accountant::TokenAccountant;
pub use error::{LedgerError, Result};
