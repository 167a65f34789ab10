//! Wire-level building blocks for talking to a MicroPython raw REPL.
//!
//! Code travels to the board as Python source rendered from a
//! [`RemoteFn`] template; results come back as printed Python values parsed
//! into [`Literal`]s. File contents travel in flow-controlled frames
//! described by [`FrameCodec`]. Nothing in this crate performs I/O.

pub mod control;
mod frame;
mod literal;
pub mod ops;
mod template;

pub use control::{ACK, CTRL_C, CTRL_D, CTRL_X};
pub use frame::{FrameCodec, FrameError, MIN_BUFFER_SIZE};
pub use literal::{Literal, LiteralError};
pub use ops::RemoteFn;
pub use template::{
    BUFFER_SIZE, DEFAULT_TIME_OFFSET, HAS_BUFFER, IS_UPY, Payload, Placeholders, RuntimeConstants,
    TIME_OFFSET, TemplateError, render,
};
