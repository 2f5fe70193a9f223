use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "roundtable")]
#[command(version = "0.1.0")]
#[command(about = "Round coordination engine for signed multi-agent trading discussions", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Bootstrap the room context and serve the agent API
    Run {
        /// Directory holding default.toml and per-environment overrides
        #[arg(short, long, default_value = "config", env = "ROUNDTABLE_CONFIG_DIR")]
        config_dir: String,
    },
    /// Print the canonical form of a JSON payload
    Canonicalize {
        /// JSON document
        json: String,
        /// Also sign it with the key of this agent id
        #[arg(long)]
        sign_as: Option<i64>,
        /// Chain id for the signing wallet
        #[arg(long, default_value = "1")]
        chain_id: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_defaults() {
        let cli = Cli::try_parse_from(["roundtable", "run"]).unwrap();
        match cli.command {
            Commands::Run { config_dir } => assert_eq!(config_dir, "config"),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_canonicalize() {
        let cli = Cli::try_parse_from(["roundtable", "canonicalize", "{\"b\":1}", "--sign-as", "3"]).unwrap();
        match cli.command {
            Commands::Canonicalize { json, sign_as, chain_id } => {
                assert_eq!(json, "{\"b\":1}");
                assert_eq!(sign_as, Some(3));
                assert_eq!(chain_id, 1);
            }
            _ => panic!("expected canonicalize"),
        }
    }
}
