#![deny(unsafe_code)]

pub mod command;
pub mod dry_run;
pub mod fallthrough;
pub mod routing;
pub mod sockdiag;
