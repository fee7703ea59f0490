pub mod coordinator;

pub use coordinator::{ComponentStatus, Coordinator, CoordinatorBuilder, HealthReport};
