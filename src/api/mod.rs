pub mod default_session;
pub mod simple;
