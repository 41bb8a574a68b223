pub mod packets;
pub mod settings;
