pub mod helpers;
pub mod init;
pub mod preset;
pub mod service;
