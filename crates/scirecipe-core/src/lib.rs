pub mod blocks;
pub mod collaborator;
pub mod config;
pub mod error;
pub mod eval;
pub mod grammar;
pub mod io;
pub mod paths;
pub mod plan;
pub mod prompts;
pub mod protocol;
pub mod quality;
pub mod record;
pub mod repair;
pub mod runner;
pub mod schema;
pub mod scoring;
pub mod sink;
pub mod tasks;
pub mod types;

pub use error::{RecipeError, Result};
