pub mod organization;
pub mod permission;
pub mod resolved;
pub mod resource;
pub mod role;
pub mod token;
