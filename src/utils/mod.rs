pub mod adapters;
pub mod command;
pub mod file;
pub mod manifest;
pub mod validation;
