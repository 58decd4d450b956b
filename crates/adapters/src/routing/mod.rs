pub mod iproute2;
pub mod rules;
