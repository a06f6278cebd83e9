//! Request transport: the HTTP seam, command dispatch and a simulated scanner.

pub mod command;
pub mod fake_scanner;
pub mod http;
