pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{StubBackend, MARKER_ILLEGAL_RGB, MARKER_VEHICLE_RGB};

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
