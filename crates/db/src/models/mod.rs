//! Domain model structs and DTOs.
//!
//! Each submodule contains:
//! - A `FromRow` + `Serialize` entity struct matching the database row
//! - DTOs for inserts and partial updates

pub mod execution;
pub mod function;
