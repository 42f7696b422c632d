pub mod identity;
pub mod network;
