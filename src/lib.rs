#![warn(rust_2018_idioms)]
#![warn(clippy::dbg_macro, clippy::print_stdout)]
#![doc = include_str!("../README.md")]

mod aggregator;
mod buffer;
mod connection;
mod error;
mod meta;
mod params;
mod request;
mod responder;

pub use crate::{
    meta::{BeginRequestFlags, ProtocolStatus, RecordType, Role},
    params::Params,
    request::Request,
    responder::{Responder, Statistics},
};
