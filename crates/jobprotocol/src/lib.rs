//! Wire-level pieces of the jobserver protocol.
//!
//! Clients send one command per line, terminated by a network newline
//! (`"\r\n"`). Job output is read back line by line from pipes where a bare
//! `"\n"` is the usual terminator. Both go through [`FramedBuffer`].

pub mod command;
pub mod framed_buffer;
pub mod reply;

pub use command::{Command, JobPid, ParseError, Verb};
pub use framed_buffer::{
    FrameError, FramedBuffer, Newline, Overflow, ReadStatus,
};
pub use reply::{Broadcast, Reply};

/// Longest line, delimiter included, either side will buffer.
pub const DEFAULT_MAX_LINE: usize = 256;
