mod entities;
mod error;
mod events;
mod gates;

pub use entities::*;
pub use error::*;
pub use events::*;
pub use gates::*;
