#![allow(unreachable_pub)]

mod error;
mod operation;
mod reply;

pub use error::ErrorKind;
pub use operation::{Callback, Operation, RequestSpec, RequestSupplier};
pub use reply::Reply;

/// The netpace `Result` type
pub type Result<T> = std::result::Result<T, crate::ErrorKind>;
