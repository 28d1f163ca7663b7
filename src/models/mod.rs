pub mod detection;
pub mod image_key;
pub mod outcome;
pub mod partition;
pub mod record;
pub mod usage;
