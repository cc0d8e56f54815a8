pub mod disk;

pub use disk::{Destination, DiskWriter, FileDestination};
