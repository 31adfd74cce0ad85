pub mod error;
pub mod response;
pub mod state;
pub mod utils;

pub use error::ApiError;
pub use response::ApiResponse;
pub use state::AppState;
pub use utils::{create_conn, DbPool};
