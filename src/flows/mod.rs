pub mod binder;
pub mod registry;

pub use binder::{BindError, ParamSpec, ParamType, bind};
pub use registry::{FlowDescriptor, FlowRegistry, ResolveError};
