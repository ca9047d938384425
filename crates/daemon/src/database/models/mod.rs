mod mount_info;

pub use mount_info::{MountFlags, MountInfo};
