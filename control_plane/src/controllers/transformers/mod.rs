mod exposed_ports;
mod ingresses;

pub use exposed_ports::*;
pub use ingresses::*;
