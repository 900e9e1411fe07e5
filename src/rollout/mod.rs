pub mod agent;
pub mod backup;
pub mod builder;
pub mod drift;
pub mod engine;
pub mod error;
pub mod guard;
pub mod keys;
pub mod layout;
pub mod progress;
pub mod rawfile;
pub mod request;

pub use engine::{TaskOutcome, WorkflowEngine};
pub use error::{GuardError, RolloutError};
pub use layout::{ArtifactClass, RolloutLayout};
pub use request::{
    CheckRequest, ConfigFile, Coordinate, FollowUpRequest, Operation, UpdateRequest,
};
