//! Command-line interface for set-forge.
//!
//! Provides commands for batch and continuous optimisation, catalogue lookups,
//! and throughput benchmarking.

mod commands;

pub use commands::{
    build_config, default_request, load_request, parse_cli, run, run_with_cli, BenchArgs, Cli,
    Commands, ContinuousArgs, LookupArgs, LookupTarget, OptimiseArgs, PoolArgs, RequestArgs,
};
