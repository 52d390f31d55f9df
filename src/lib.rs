//! The _easyrsa_ library crate.
//!
//! A small public key infrastructure in the spirit of the classic easy-rsa
//! scripts: a self-signed CA, RSA client and server certificates signed by
//! the most recent CA, monotonic serial numbers shared safely between
//! processes on one host, and a signed certificate revocation list. All
//! state lives on the local filesystem.

#[macro_use]
extern crate log;

pub mod cli;
pub mod commons;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod pki;
pub mod storage;
