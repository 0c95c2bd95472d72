pub mod coordination;
pub mod exception;
pub mod filter;
pub mod reference;
pub mod registry;

pub use coordination::{
    Coordination, CoordinationScope, CoordinationStack, Coordinator, Participant,
};
pub use exception::{CoordinationError, FailureCause, TetherError, TetherResult};
pub use filter::Filter;
pub use reference::{
    ServiceId, ServiceProperties, ServiceReference, TransformedServiceReference, INSTANCE_NAME,
    SERVICE_ID, SERVICE_PID, SERVICE_RANKING,
};
pub use registry::{
    ListenerId, ServiceEvent, ServiceListener, ServiceObject, ServiceRegistration, ServiceRegistry,
};
