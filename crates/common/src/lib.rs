// beacon-common: shared types for the Beacon workspace

pub mod types;
