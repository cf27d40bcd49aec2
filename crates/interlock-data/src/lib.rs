pub mod layout;
pub mod loader;
pub mod schema;

pub use layout::{Layout, load_layout};
pub use loader::DataLoadError;
