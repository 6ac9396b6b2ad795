pub mod archive;
pub mod bundle;
pub mod commands;
pub mod fix;
pub mod manager;
