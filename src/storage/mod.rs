pub mod paths;
pub mod remote;
#[cfg(feature = "s3")]
pub mod s3;
pub mod tiered;

pub use paths::*;
pub use remote::*;
#[cfg(feature = "s3")]
pub use s3::S3Remote;
pub use tiered::*;
