#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared plumbing for the podping writer: tunable settings and the podping
//! payload schema.

pub mod podping;
pub mod settings;
