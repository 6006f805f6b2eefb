use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "docrag",
    about = "Answer questions grounded in your own documents"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Config file (defaults to config.toml in the data directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Chunk, embed and index every document in a directory
    Build(BuildArgs),
    /// Show the chunks most relevant to a query
    Search(SearchArgs),
    /// Ask a question, or start an interactive session without -q
    Ask(AskArgs),
    /// Show the data directory and stored partitions
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Build --

#[derive(Debug, Parser)]
pub struct BuildArgs {
    /// Directory containing the source documents
    pub docs_dir: PathBuf,

    /// Glob pattern selecting files (repeatable; replaces build.include)
    #[arg(long = "include", value_name = "GLOB")]
    pub include: Vec<String>,

    /// Delete stored partitions whose source file is gone
    #[arg(long)]
    pub prune: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return (overrides retrieval.top_k)
    #[arg(short = 'k', long)]
    pub top_k: Option<usize>,

    /// Minimum similarity (overrides retrieval.similarity_threshold)
    #[arg(long)]
    pub threshold: Option<f32>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Ask --

#[derive(Debug, Parser)]
pub struct AskArgs {
    /// Answer this question and exit
    #[arg(short, long)]
    pub query: Option<String>,

    /// Number of chunks used as context (overrides retrieval.top_k)
    #[arg(short = 'k', long)]
    pub top_k: Option<usize>,

    /// Minimum similarity (overrides retrieval.similarity_threshold)
    #[arg(long)]
    pub threshold: Option<f32>,

    /// Completion model (overrides completion.model)
    #[arg(long)]
    pub model: Option<String>,

    /// Print the answer as it is generated
    #[arg(long)]
    pub stream: bool,

    /// Also print the retrieved chunks
    #[arg(long)]
    pub show_context: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "docrag",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parse_ask_defaults() {
        let cli = Cli::parse_from(["docrag", "ask"]);
        match cli.command {
            Command::Ask(args) => {
                assert_eq!(args.query, None);
                assert_eq!(args.top_k, None);
                assert_eq!(args.threshold, None);
                assert!(!args.stream);
            }
            _ => panic!("expected ask command"),
        }
        assert!(!cli.quiet);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn parse_ask_with_query_and_overrides() {
        let cli = Cli::parse_from([
            "docrag",
            "ask",
            "-q",
            "what is rust?",
            "--top-k",
            "5",
            "--model",
            "gpt-4o-mini",
            "--stream",
        ]);
        match cli.command {
            Command::Ask(args) => {
                assert_eq!(args.query.as_deref(), Some("what is rust?"));
                assert_eq!(args.top_k, Some(5));
                assert_eq!(args.model.as_deref(), Some("gpt-4o-mini"));
                assert!(args.stream);
            }
            _ => panic!("expected ask command"),
        }
    }

    #[test]
    fn parse_build_with_globals() {
        let cli = Cli::parse_from([
            "docrag",
            "build",
            "./docs",
            "--include",
            "*.md",
            "--include",
            "*.rst",
            "--data-dir",
            "/tmp/rag",
            "-vv",
        ]);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/rag")));
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Build(args) => {
                assert_eq!(args.docs_dir, PathBuf::from("./docs"));
                assert_eq!(args.include, vec!["*.md", "*.rst"]);
                assert!(!args.prune);
            }
            _ => panic!("expected build command"),
        }
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        let result =
            Cli::try_parse_from(["docrag", "--quiet", "-v", "status"]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
