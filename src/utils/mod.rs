//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod clock;
mod error;
mod safetcp;

pub use bitmap::Bitmap;
pub use clock::{Clock, ManualClock, SkewedClock, SystemClock};
pub use error::SynleaseError;
pub use print::{logger_init, me_init, ME};

pub(crate) use safetcp::{
    tcp_bind_with_retry, tcp_connect_with_retry, tcp_recv_obj, tcp_send_obj,
};
