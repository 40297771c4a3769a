pub mod jobs;
pub mod system;

pub use jobs::JobHttpError;
