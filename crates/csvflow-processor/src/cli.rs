//! Command-line interface definitions

use clap::{Args, Parser, Subcommand};
use csvflow_common::types::ObjectRef;

#[derive(Parser, Debug)]
#[command(name = "csvflow-processor")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Object addressed by bucket and name
#[derive(Args, Debug, Clone)]
pub struct ObjectArgs {
    /// Source bucket (defaults to CSVFLOW_BUCKET)
    #[arg(short, long, env = "CSVFLOW_BUCKET")]
    pub bucket: String,

    /// Object name within the bucket
    #[arg(short, long)]
    pub name: String,
}

impl ObjectArgs {
    pub fn object(&self) -> ObjectRef {
        ObjectRef::new(&self.bucket, &self.name)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Consume notifications from the work queue until interrupted
    Run,

    /// Process one object directly, bypassing the queue
    Process {
        #[command(flatten)]
        object: ObjectArgs,

        /// Reprocess even if the file already completed
        #[arg(short, long)]
        force: bool,
    },

    /// Enqueue an object-created notification for an object
    Publish {
        #[command(flatten)]
        object: ObjectArgs,
    },

    /// Print the summary record of an object as JSON
    Summary {
        #[command(flatten)]
        object: ObjectArgs,
    },

    /// Print the fingerprint of an object, or the key of one of its rows
    Key {
        #[command(flatten)]
        object: ObjectArgs,

        /// 1-based data row number
        #[arg(short, long)]
        row: Option<u64>,
    },

    /// List the most recent dead-lettered notifications
    DeadLetters {
        /// Maximum entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_process_command() {
        let cli = Cli::try_parse_from([
            "csvflow-processor",
            "process",
            "--bucket",
            "uploads",
            "--name",
            "a/b.csv",
            "--force",
        ])
        .unwrap();

        match cli.command {
            Commands::Process { object, force } => {
                assert!(force);
                assert_eq!(object.object(), ObjectRef::new("uploads", "a/b.csv"));
            },
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parses_key_with_row() {
        let cli = Cli::try_parse_from([
            "csvflow-processor",
            "-v",
            "key",
            "-b",
            "uploads",
            "-n",
            "a.csv",
            "--row",
            "42",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Key { row: Some(42), .. }));
    }
}
