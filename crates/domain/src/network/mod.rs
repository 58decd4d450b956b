pub mod entity;
pub mod error;
pub mod route;
pub mod uid_range;
