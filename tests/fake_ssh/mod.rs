//! In-process fake SSH server for connection tests
//!
//! A real russh server on `127.0.0.1` with an OS-assigned port. It
//! authenticates one public key, runs a handful of canned commands and
//! forwards `direct-tcpip` channels, so the same server can stand in
//! for the mail host or for the jump host in front of it.
//!
//! ```text
//!   SshConnection --ssh--> jump (FakeSshServer)
//!                            | direct-tcpip 127.0.0.1:<target port>
//!                            v
//!                          target (FakeSshServer) --exec--> canned reply
//! ```
//!
//! ## Module layout
//!
//! - `server` -- `FakeSshServer`, its per-connection handler, and the
//!   helper that writes a client key to disk

#![allow(dead_code)]

mod server;

pub use server::{FakeSshServer, write_client_key};
