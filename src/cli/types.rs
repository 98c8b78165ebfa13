//! CLI argument types and command structures.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "swarmforge")]
#[command(version, about = "Multi-agent build orchestrator CLI", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive a pipeline run to completion and print the final summary.
    Run {
        /// Chat id this run belongs to.
        #[arg(long)]
        chat: String,

        /// Project id this run belongs to.
        #[arg(long)]
        project: String,

        /// Filesystem root of the project checkout.
        #[arg(long = "project-path")]
        project_path: String,

        /// The user's build/fix/question request.
        #[arg(long)]
        message: String,

        /// Force intent classification instead of calling `orchestrator:classify`.
        #[arg(long, value_enum)]
        intent: Option<IntentArg>,

        /// Force scope instead of calling `orchestrator:classify`.
        #[arg(long, value_enum)]
        scope: Option<ScopeArg>,
    },

    /// Continue an interrupted pipeline run from its first non-completed step.
    Resume {
        /// Chat id the pipeline run belongs to.
        #[arg(long)]
        chat: String,

        /// Pipeline run id to resume.
        #[arg(long = "pipeline-run")]
        pipeline_run: String,
    },

    /// Abort the in-flight pipeline run for a chat.
    Abort {
        /// Chat id to abort.
        #[arg(long)]
        chat: String,
    },

    /// Print whether a chat has an active pipeline run, plus its step table.
    Status {
        /// Chat id to inspect.
        #[arg(long)]
        chat: String,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum IntentArg {
    Build,
    Fix,
    Question,
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum ScopeArg {
    Frontend,
    Backend,
    Styling,
    Full,
}
