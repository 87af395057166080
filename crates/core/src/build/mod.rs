//! Building function artifacts.

pub mod builder;
pub mod manifest;
pub mod mock;

pub use builder::{
    function_dir, prune_artifacts, remove_function_artifacts, ArtifactBuilder, BuildFailure,
    BuildOutput, BuildSpec, LocalArtifactBuilder,
};
