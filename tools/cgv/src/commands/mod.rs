pub mod init;
pub mod install;
pub mod job;
pub mod status;
pub mod validate;
