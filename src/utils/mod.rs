pub mod locks;
pub mod logging;
pub mod path_resolver;
pub mod ports;
pub mod validation;
