//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument.

pub mod function_execution_repo;
pub mod function_repo;

pub use function_execution_repo::FunctionExecutionRepo;
pub use function_repo::FunctionRepo;
