//! Command-line interface

pub mod commands;

pub use commands::{
    cmd_config, cmd_health, cmd_keygen, cmd_send, cmd_start, load_config, parse_peers, CliResult,
    Overrides,
};
