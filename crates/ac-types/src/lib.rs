pub mod condition;
pub mod config;
pub mod design;
pub mod errors;
pub mod job;
pub mod observation;

pub use condition::*;
pub use config::*;
pub use design::*;
pub use errors::*;
pub use job::*;
pub use observation::*;
