use std::{io::IsTerminal, time::Duration};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use piecemeal_peer::StrategyKind;

#[derive(Parser, Debug)]
#[command(name = "piecemeal")]
#[command(bin_name = "piecemeal")]
pub struct Cli {
    #[arg(long, env)]
    pub no_ui: bool,

    #[command(subcommand)]
    pub commands: Commands,
}

impl Cli {
    pub fn no_ui(&self) -> bool {
        self.no_ui || !std::io::stdout().is_terminal()
    }

    pub fn version(&self) -> bool {
        matches!(self.commands, Commands::Version)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download a random payload from simulated seeders over a loopback
    /// transport.
    Simulate(SimulateArgs),
    Version,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SimulateArgs {
    #[arg(long, default_value = "64")]
    pub pieces: u32,

    #[arg(long = "piece-size", default_value = "16384")]
    pub piece_size: u32,

    #[arg(long = "block-size", default_value = "4096")]
    pub block_size: u32,

    #[arg(long, short = 'n', default_value = "4")]
    pub seeders: usize,

    /// Seeders that serve garbage instead of piece contents.
    #[arg(long = "corrupt-seeders", default_value = "0")]
    pub corrupt_seeders: usize,

    /// index-order or rarest-first
    #[arg(long, env = "PIECEMEAL_STRATEGY", default_value = "index-order")]
    pub strategy: StrategyKind,

    /// Requests kept in flight per seeder.
    #[arg(long, default_value = "4")]
    pub pipeline: usize,

    #[arg(long = "claim-timeout-ms", default_value = "5000")]
    pub claim_timeout_ms: u64,

    /// RNG seed for the payload and seeder behavior; random if unset.
    #[arg(long, env = "PIECEMEAL_SEED")]
    pub seed: Option<u64>,
}

impl SimulateArgs {
    pub fn validate(&self) -> Result<()> {
        if self.pieces == 0 || self.piece_size == 0 || self.block_size == 0 {
            bail!("pieces, piece size and block size must be non-zero");
        }
        if self.block_size > self.piece_size {
            bail!("block size {} exceeds piece size {}", self.block_size, self.piece_size);
        }
        if self.seeders == 0 {
            bail!("at least one seeder is required");
        }
        if self.corrupt_seeders >= self.seeders {
            bail!("at least one seeder must be honest");
        }
        if self.pipeline == 0 {
            bail!("pipeline must be at least 1");
        }
        if self.claim_timeout_ms == 0 {
            bail!("claim timeout must be non-zero");
        }
        Ok(())
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    pub fn payload_len(&self) -> usize {
        self.pieces as usize * self.piece_size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simulate_defaults() {
        let cli = Cli::try_parse_from(["piecemeal", "--no-ui", "simulate"]).expect("parse");
        assert!(cli.no_ui());
        assert!(!cli.version());
        let Commands::Simulate(args) = cli.commands else {
            panic!("expected simulate");
        };
        assert_eq!(args.pieces, 64);
        assert_eq!(args.strategy, StrategyKind::IndexOrder);
        assert_eq!(args.claim_timeout(), Duration::from_secs(5));
        args.validate().expect("valid");
    }

    #[test]
    fn parse_simulate_strategy() {
        let cli = Cli::try_parse_from([
            "piecemeal",
            "simulate",
            "--strategy",
            "rarest-first",
            "--seeders",
            "3",
            "--corrupt-seeders",
            "1",
            "--seed",
            "7",
        ])
        .expect("parse");
        let Commands::Simulate(args) = cli.commands else {
            panic!("expected simulate");
        };
        assert_eq!(args.strategy, StrategyKind::RarestFirst);
        assert_eq!(args.seed, Some(7));
        args.validate().expect("valid");

        assert!(Cli::try_parse_from(["piecemeal", "simulate", "--strategy", "fastest"]).is_err());
    }

    #[test]
    fn validate_rejects_bad_sizes() {
        let cli = Cli::try_parse_from([
            "piecemeal",
            "simulate",
            "--piece-size",
            "1024",
            "--block-size",
            "2048",
        ])
        .expect("parse");
        let Commands::Simulate(args) = cli.commands else {
            panic!("expected simulate");
        };
        assert!(args.validate().is_err());

        let args = SimulateArgs {
            block_size: 512,
            corrupt_seeders: args.seeders,
            ..args
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn parse_version() {
        let cli = Cli::try_parse_from(["piecemeal", "version"]).expect("parse");
        assert!(cli.version());
    }
}
