pub mod env;
pub mod local;
pub mod refs;
pub mod shareable;
pub mod synchronize;
