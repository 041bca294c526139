pub mod crypto;
pub mod db;
pub mod model;
mod settings;

pub use db::Store;
pub use model::LinkRecord;
