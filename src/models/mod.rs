pub mod chat;
pub mod model;
