//! codecell CLI - run the Python code blocks of posts and notebooks.

mod blocks;
mod colors;
mod output;
mod run;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "codecell")]
#[command(about = "Run the Python code blocks of posts and notebooks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every Python block of a Markdown post, notebook or script
    Run {
        /// Path to a .md, .ipynb or .py file
        path: String,

        /// Print raw HTML output instead of terminal text
        #[arg(long)]
        html: bool,

        /// Write all outputs to an HTML page
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Run a single snippet (reads stdin when CODE is omitted)
    Exec {
        /// Python source
        code: Option<String>,

        /// Print raw HTML output instead of terminal text
        #[arg(long)]
        html: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Helper to format codecell-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<codecell_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Run { path, html, output } => {
            run::execute(&path, html, output.as_deref())
                .await
                .map_err(format_error)?;
        }

        Commands::Exec { code, html } => {
            run::exec(code, html).await.map_err(format_error)?;
        }
    }

    Ok(())
}
