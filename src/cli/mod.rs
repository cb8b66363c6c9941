//! Command line interface
//!
//! `crane` is a thin router: every subcommand parses its references and
//! calls into [`crate::remote`] or [`crate::copy`].

pub mod args;
pub mod runner;

pub use args::{Args, AuthCommand, Command, GlobalArgs};
pub use runner::Runner;
