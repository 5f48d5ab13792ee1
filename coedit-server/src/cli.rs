//! Command line arguments for the coedit server.
//!
//! Every flag is optional. Unset flags fall back to the environment
//! variables read by [`CollabConfig::from_env`], then to the defaults.

use std::time::Duration;

use clap::builder::RangedU64ValueParser;
use clap::Parser;
use coedit_collab::CollabConfig;
use coedit_core::EngineKind;

/// Collaborative text editing server
#[derive(Parser, Debug, Default)]
#[command(name = "coedit-server")]
#[command(about = "Real-time collaborative editing over WebSockets")]
#[command(version)]
pub struct Cli {
    /// Address to bind to
    #[arg(short, long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// CRDT engine: custom or state-delta (alias yjs)
    #[arg(short, long)]
    pub engine: Option<EngineKind>,

    /// Maximum number of live documents
    #[arg(long, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub max_documents: Option<usize>,

    /// Maximum document size in bytes
    #[arg(long, value_name = "BYTES", value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub max_document_size: Option<usize>,

    /// Seconds an empty document may stay idle before it is swept
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub document_ttl: Option<u64>,

    /// Seconds between idle sweeps
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub sweep_interval: Option<u64>,
}

impl Cli {
    /// Override `config` with every flag that was given.
    pub fn apply(self, mut config: CollabConfig) -> CollabConfig {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(engine) = self.engine {
            config.engine = engine;
        }
        if let Some(max) = self.max_documents {
            config.max_documents = max;
        }
        if let Some(bytes) = self.max_document_size {
            config.max_document_bytes = bytes;
        }
        if let Some(secs) = self.document_ttl {
            config.idle_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = self.sweep_interval {
            config.sweep_interval = Duration::from_secs(secs);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_flags_keeps_config() {
        let cli = Cli::try_parse_from(["coedit-server"]).unwrap();
        assert_eq!(cli.apply(CollabConfig::default()), CollabConfig::default());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "coedit-server",
            "--bind",
            "0.0.0.0:9000",
            "--engine",
            "yjs",
            "--max-documents",
            "10",
            "--document-ttl",
            "5",
        ])
        .unwrap();
        let config = cli.apply(CollabConfig::default());

        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.engine, EngineKind::StateDelta);
        assert_eq!(config.max_documents, 10);
        assert_eq!(config.idle_ttl, Duration::from_secs(5));
        assert_eq!(config.max_document_bytes, CollabConfig::default().max_document_bytes);
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        for flag in ["--max-documents", "--max-document-size", "--document-ttl", "--sweep-interval"] {
            assert!(Cli::try_parse_from(["coedit-server", flag, "0"]).is_err(), "{flag} 0");
            assert!(Cli::try_parse_from(["coedit-server", flag, "1"]).is_ok(), "{flag} 1");
        }
    }

    #[test]
    fn test_unknown_engine_is_rejected() {
        assert!(Cli::try_parse_from(["coedit-server", "--engine", "ot"]).is_err());
    }
}
