//! Datarepo is a library for version-controlling dataset projects: build
//! pipelines over named stages, content-addressed caching of intermediate
//! datasets, and working/index/revision views of the project configuration.
pub mod cache;
pub mod config;
pub mod dataset;
pub mod environment;
pub mod errors;
pub mod hash;
pub mod ignore;
pub mod names;
pub mod project;
pub mod vcs;

pub use crate::{
    config::{
        BuildStage, BuildTarget, DEFAULT_FORMAT, ModelConfig, Options, ProjectConfig,
        RemoteConfig, RemoteType, SourceConfig, StageType, TreeConfig,
    },
    dataset::{Dataset, DatasetItem},
    environment::Environment,
    errors::{DatarepoError, Result},
    project::{Project, Tree, TreePosition},
};
