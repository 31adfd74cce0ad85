pub mod core;
pub use self::core::*;

#[path = "goals.rs"]
mod goals_tables;
pub use self::goals_tables::*;

pub mod requests;
pub use self::requests::*;
