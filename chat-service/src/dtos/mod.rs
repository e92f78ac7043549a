pub mod sessions;

pub use sessions::RenameInput;
