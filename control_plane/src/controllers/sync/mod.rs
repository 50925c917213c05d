mod ingresses;
mod load_balancer;

pub use ingresses::*;
pub use load_balancer::*;
