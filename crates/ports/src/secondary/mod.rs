pub mod fallthrough_port;
pub mod routing_port;
pub mod socket_diag_port;
