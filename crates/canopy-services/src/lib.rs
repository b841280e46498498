//! canopy-services: the service dispatch layer of the Canopy entity graph.
//!
//! A [`ServiceRequest`] names an action, a path and a payload. The
//! [`ServiceManager`] resolves the path to a resource type, checks the
//! acting principal's permission for `{resource}:{action}`, and runs the
//! operation through [`canopy_graph::EntityManager`].

pub mod dispatch;
pub mod error;
pub mod request;
pub mod results;
pub mod script;

pub use dispatch::{Resource, ServiceManager, Target};
pub use error::{Result, ServiceError};
pub use request::{RequestState, ServiceAction, ServiceParameter, ServicePayload, ServiceRequest};
pub use results::{Outcome, ServiceResults};
