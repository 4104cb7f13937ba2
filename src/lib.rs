#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod queue;
pub mod session;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;
