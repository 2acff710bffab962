pub mod events;
pub mod models;
pub mod protocol;
pub mod traits;

pub use events::*;
pub use models::*;
pub use protocol::*;
pub use traits::*;
