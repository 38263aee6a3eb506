//! Command line front-end: clap parsing and conversion into an `AppConfig`
//! plus a `MatchSpecification`.

mod clap_parser;

pub use clap_parser::{Cli, env_file_arg};
