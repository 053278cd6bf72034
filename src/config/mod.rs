pub mod connections;
pub mod settings;

pub use connections::*;
pub use settings::*;
