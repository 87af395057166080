pub mod functions;
pub mod public;
