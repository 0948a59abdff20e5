pub mod artifact;
pub mod conversation;
