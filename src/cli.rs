use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build every missing artifact for one episode or the whole group
    Run {
        /// Episode manifest produced by the catalog resolver
        #[arg(short, long)]
        manifest: PathBuf,

        /// Restrict the run to a single episode id
        #[arg(short, long)]
        episode: Option<String>,

        /// Layers to invalidate before the run (comma-separated)
        #[arg(short, long)]
        invalidate: Option<String>,

        /// Track flagged as default in the mux (es, en, ru, refs, dual)
        #[arg(long)]
        default_subtitle: Option<String>,
    },

    /// Remove layers and everything derived from them without running
    Invalidate {
        /// Episode manifest produced by the catalog resolver
        #[arg(short, long)]
        manifest: PathBuf,

        /// Restrict the invalidation to a single episode id
        #[arg(short, long)]
        episode: Option<String>,

        /// Layers to invalidate (comma-separated)
        #[arg(short, long)]
        layers: String,
    },

    /// Print the layer graph, or the closure of the given layers
    Layers {
        /// Layers whose downstream closure to print (comma-separated)
        #[arg(long)]
        closure: Option<String>,
    },

    /// Show which layers exist and how far chunked tracks have progressed
    Status {
        /// Episode manifest produced by the catalog resolver
        #[arg(short, long)]
        manifest: PathBuf,

        /// Restrict the report to a single episode id
        #[arg(short, long)]
        episode: Option<String>,
    },

    /// Write the default configuration to a file
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "subweave.toml")]
        output: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_invalidation() {
        let args = Args::parse_from([
            "subweave",
            "-v",
            "run",
            "--manifest",
            "show.toml",
            "--episode",
            "S01E02",
            "--invalidate",
            "subs_ru,mux",
            "--default-subtitle",
            "ru-dual",
        ]);
        assert!(args.verbose);
        match args.command {
            Commands::Run { manifest, episode, invalidate, default_subtitle } => {
                assert_eq!(manifest, PathBuf::from("show.toml"));
                assert_eq!(episode.as_deref(), Some("S01E02"));
                assert_eq!(invalidate.as_deref(), Some("subs_ru,mux"));
                assert_eq!(default_subtitle.as_deref(), Some("ru-dual"));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_invalidate_requires_layers() {
        assert!(Args::try_parse_from(["subweave", "invalidate", "--manifest", "m.toml"]).is_err());
    }
}
