pub mod app;
pub mod boundary;
pub mod session;
