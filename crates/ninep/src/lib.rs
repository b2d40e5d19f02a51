#![forbid(unsafe_code)]
//! Asynchronous 9P2000 file-service server library for Rust.
//!
//! This crate provides a tokio-based server-side implementation of the
//! 9P2000 protocol: the message-framed, tag-multiplexed request/response
//! protocol from Plan 9 used to export a file hierarchy over a reliable
//! bidirectional byte stream.
//!
//! # Overview
//!
//! To serve a file tree you need to:
//!
//! 1. Define a handle type representing a position in your tree or an open
//!    file
//! 2. Implement the [`srv::Backend`] trait for your file tree
//! 3. Start the server with [`srv::srv_async`], hand streams to a
//!    [`srv::NetListener`], or drive a single stream with [`srv::serve_rwc`]
//!
//! The library owns everything protocol-side: the wire codec, framing,
//! version negotiation, the fid table, tag accounting with Tflush
//! cancellation, and the per-connection read→decode→dispatch→encode→write
//! loop. A backend only ever sees its own handles and never a fid.
//!
//! # Example
//!
//! ```no_run
//! use ninep::{srv::{Backend, Walked, srv_async}, session::OpCtx, Qid, QidType, Stat, Result};
//! use async_trait::async_trait;
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl Backend for Hello {
//!     type Handle = u64;
//!
//!     async fn attach(
//!         &self,
//!         _ctx: &OpCtx,
//!         _afid: Option<&u64>,
//!         _uname: &str,
//!         _aname: &str,
//!     ) -> Result<(Qid, u64)> {
//!         Ok((Qid { typ: QidType::DIR, version: 0, path: 0 }, 0))
//!     }
//!
//!     // Implement the remaining operations...
//!     # async fn walk(&self, _: &OpCtx, _: &u64, _: &[String]) -> Result<Walked<u64>> { todo!() }
//!     # async fn open(&self, _: &OpCtx, _: &u64, _: u8) -> Result<(Qid, u32)> { todo!() }
//!     # async fn create(&self, _: &OpCtx, _: &u64, _: &str, _: u32, _: u8) -> Result<(Qid, u32, u64)> { todo!() }
//!     # async fn read(&self, _: &OpCtx, _: &u64, _: u64, _: u32) -> Result<Vec<u8>> { todo!() }
//!     # async fn write(&self, _: &OpCtx, _: &u64, _: u64, _: &[u8]) -> Result<u32> { todo!() }
//!     # async fn remove(&self, _: &OpCtx, _: &u64) -> Result<()> { todo!() }
//!     # async fn stat(&self, _: &OpCtx, _: &u64) -> Result<Stat> { todo!() }
//!     # async fn wstat(&self, _: &OpCtx, _: &u64, _: &Stat) -> Result<()> { todo!() }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     srv_async(Hello, "tcp!127.0.0.1!5640").await
//! }
//! ```
//!
//! # Protocol Details
//!
//! ## Message Flow
//!
//! 1. **Version Negotiation**: client sends `Tversion`, server responds with
//!    `Rversion`; every other message beforehand is rejected
//! 2. **Authentication** (optional): `Tauth`/`Rauth` exchange
//! 3. **Attach**: client attaches to a file tree root with `Tattach`
//! 4. **Operations**: walk, open, create, read, write, stat, wstat
//! 5. **Cleanup**: client clunks fids with `Tclunk` to release resources
//!
//! A client may keep several requests outstanding, distinguished by tag, and
//! may cancel one with `Tflush`. Once the server has answered the flush, it
//! will never reply to the cancelled tag.
//!
//! ## Fid Management
//!
//! A "fid" is a client-chosen 32-bit handle denoting a position in the file
//! tree or an open file.
//!
//! **Important invariants:**
//! - Each fid is unique per connection and never `NOFID`
//! - Walking to a distinct new fid leaves the old one valid
//! - An open fid can neither be walked nor reopened
//! - After `Tclunk` the fid is gone, whatever the backend said
//! - `Tversion` resets the fid table and all in-flight tags
//!
//! # Error Handling
//!
//! Backends return [`error::Error`]; the server turns any error into an
//! `Rerror` reply carrying the error's `Display` form. Only transport-level
//! failures terminate a connection.
//!
//! # Transport
//!
//! The library supports multiple transports:
//! - **TCP**: `"tcp!host!port"` (e.g., `"tcp!0.0.0.0!5640"`)
//! - **Unix Domain Sockets**: `"unix!path!0"`
//! - Anything else via [`srv::StreamFactory`] or [`srv::serve_rwc`]
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`) and relies on
//! Rust's type system for memory safety.
pub mod error;
pub mod fcall;
pub mod serialize;
pub mod session;
pub mod srv;
pub mod tracer;

pub use crate::error::{Error, Result};
pub use crate::fcall::*;
