// ── Device maps and the propagation registry ──

pub mod map;
pub mod registry;

pub use map::DeviceMap;
pub use registry::MapRegistry;
