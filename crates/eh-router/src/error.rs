use std::fmt;

use eh_checkpoint::CheckpointError;
use eh_util::UtilError;
use thiserror::Error;

use crate::executor::{CommandKind, State};
use crate::query::CompilationError;

/// Compilation problems for one route
#[derive(Debug, Clone, PartialEq)]
pub struct RouteCompileFailure {
    pub route: String,
    pub errors: Vec<CompilationError>,
}

impl fmt::Display for RouteCompileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route '{}':", self.route)?;
        for error in &self.errors {
            write!(f, " [{}]", error)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Route compilation failed for {} route(s)", .failures.len())]
    Compilation { failures: Vec<RouteCompileFailure> },

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("Endpoint {0} is dead")]
    EndpointDead(String),

    #[error("Executor for endpoint {0} is closed")]
    ExecutorClosed(String),

    #[error("Command {command:?} is not valid in state {state:?}")]
    InvalidTransition { state: State, command: CommandKind },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Concurrency error: {0}")]
    Concurrency(#[from] UtilError),

    #[error("Endpoint configuration error: {0}")]
    Endpoint(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Message offset {offset} is not positive; sources number messages from 1")]
    InvalidOffset { offset: i64 },

    #[error("Router is shutting down")]
    ShutdownInProgress,
}

impl RouterError {
    pub fn compilation(failures: Vec<RouteCompileFailure>) -> Self {
        Self::Compilation { failures }
    }

    pub fn endpoint(msg: impl Into<String>) -> Self {
        Self::Endpoint(msg.into())
    }

    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    /// Every compilation problem, flattened with its route name
    pub fn compilation_errors(&self) -> Vec<(&str, &CompilationError)> {
        match self {
            RouterError::Compilation { failures } => failures
                .iter()
                .flat_map(|f| f.errors.iter().map(move |e| (f.route.as_str(), e)))
                .collect(),
            _ => Vec::new(),
        }
    }
}
