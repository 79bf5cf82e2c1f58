//! EdgeHub Message Router
//!
//! This crate provides the hub routing core:
//! - Router: compiled route table, multicast matching, per-endpoint fan-out
//! - Condition language: route predicates over properties and JSON bodies
//! - EndpointExecutor: per-endpoint delivery state machine with checkpointing
//! - Endpoint: delivery boundary (HTTP, null)
//! - Source / SourceFactory: ingestion run loops feeding the router
//! - Lifecycle: configuration reload consumer and health reporting

pub mod endpoint;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod query;
pub mod route;
pub mod router;
pub mod router_metrics;
pub mod source;

pub use endpoint::{Endpoint, EndpointFactory, HttpEndpoint, NullEndpoint, SendOutcome, SpecEndpointFactory};
pub use error::{RouteCompileFailure, RouterError};
pub use executor::{
    Command, CommandKind, EndpointExecutor, EndpointExecutorConfig, ExecutorEvent, ExecutorStatus,
    State, StateMachine, TransitionRecord,
};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use query::{CompilationError, Condition, ErrorSeverity, JsonPathValidator, TwinChangeJsonPathValidator};
pub use route::{Route, RouteTable};
pub use router::{RouteOutcome, Router};
pub use source::{
    ChannelSource, ChannelSourceFactory, NullSource, NullSourceFactory, OffsetSequence, Source,
    SourceFactory,
};

pub type Result<T> = std::result::Result<T, RouterError>;
