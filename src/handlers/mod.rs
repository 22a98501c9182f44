mod health;
mod proxy;

pub use health::{HealthResponse, health_check, readiness_check};
pub use proxy::proxy;
