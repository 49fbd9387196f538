//! Run and exec command implementations.
//!
//! Blocks run in order against one interpreter session, so later blocks see
//! the variables of earlier ones. Ctrl-C interrupts the running block and
//! skips the rest.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::Instant;

use codecell_core::{
    CancellationToken, ExecutionOutput, ExecutionService, ExecutionStatus, PythonRuntime,
    RunOptions, ServiceConfig,
};

use crate::blocks::{self, CodeBlock};
use crate::colors;
use crate::output::{render_page, to_terminal};

/// Run every block of a file.
pub async fn execute(path: &str, raw_html: bool, output_path: Option<&str>) -> anyhow::Result<()> {
    let start = Instant::now();
    let path = Path::new(path);
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }

    let blocks = blocks::extract(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    println!(
        "\n{}codecell{} - {}{}{}",
        colors::BOLD,
        colors::RESET,
        colors::CYAN,
        name,
        colors::RESET
    );
    println!("{}", "─".repeat(50));

    if blocks.is_empty() {
        println!(
            "\n{}No runnable Python blocks found.{}",
            colors::YELLOW,
            colors::RESET
        );
        println!("Blocks are fenced with ```python, ```py or ```python3 (or notebook code cells)");
        return Ok(());
    }

    let service = ExecutionService::python(ServiceConfig::from_env());
    println!("{}Starting Python runtime...{}", colors::DIM, colors::RESET);
    service.initialize().await?;

    let mut results: Vec<(CodeBlock, ExecutionOutput)> = Vec::new();
    let mut failed = 0;
    let mut interrupted = false;

    for (index, block) in blocks.iter().enumerate() {
        println!(
            "\n{}▶ Block {}/{}{} {}({}){}",
            colors::CYAN,
            index + 1,
            blocks.len(),
            colors::RESET,
            colors::DIM,
            block.location,
            colors::RESET
        );

        let output = run_block(&service, &block.source).await?;
        print_output(&output, raw_html);

        match &output.status {
            ExecutionStatus::Completed => {}
            ExecutionStatus::Failed { .. } => failed += 1,
            ExecutionStatus::Interrupted | ExecutionStatus::Cancelled => interrupted = true,
        }
        results.push((block.clone(), output));

        if interrupted {
            println!(
                "{}Interrupted; skipping remaining blocks.{}",
                colors::YELLOW,
                colors::RESET
            );
            break;
        }
    }

    if let Some(output_path) = output_path {
        fs::write(output_path, render_page(&name, &results))?;
        println!("\n{}Wrote{} {}", colors::GREEN, colors::RESET, output_path);
    }

    // Summary
    println!("\n{}", "─".repeat(50));
    let total = start.elapsed().as_secs_f64();
    if failed > 0 {
        anyhow::bail!(
            "{} of {} blocks failed ({:.2}s)",
            failed,
            results.len(),
            total
        );
    }
    println!(
        "{}Completed{} {} blocks in {:.2}s",
        colors::GREEN,
        colors::RESET,
        results.len(),
        total
    );

    Ok(())
}

/// Run one snippet.
pub async fn exec(code: Option<String>, raw_html: bool) -> anyhow::Result<()> {
    let code = match code {
        Some(code) => code,
        None => {
            let mut code = String::new();
            std::io::stdin().read_to_string(&mut code)?;
            code
        }
    };

    let service = ExecutionService::python(ServiceConfig::from_env());
    let output = run_block(&service, &code).await?;
    print_output(&output, raw_html);

    match output.status {
        ExecutionStatus::Failed { .. } => anyhow::bail!("execution failed"),
        _ => Ok(()),
    }
}

/// Run `code`, cancelling it on Ctrl-C.
async fn run_block(
    service: &ExecutionService<PythonRuntime>,
    code: &str,
) -> codecell_core::Result<ExecutionOutput> {
    let token = CancellationToken::new();
    let watcher = tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        }
    });

    let output = service
        .run_with(code, RunOptions::new().with_cancel(token))
        .await;
    watcher.abort();
    output
}

fn print_output(output: &ExecutionOutput, raw_html: bool) {
    if raw_html {
        println!("{}", output.html);
        return;
    }

    let text = to_terminal(&output.html);
    let text = text.trim_end();
    match &output.status {
        ExecutionStatus::Completed => println!("{}", text),
        ExecutionStatus::Failed { .. } => {
            println!("{}{}{}", colors::RED, text, colors::RESET);
        }
        ExecutionStatus::Interrupted | ExecutionStatus::Cancelled => {
            println!("{}{}{}", colors::YELLOW, text, colors::RESET);
        }
    }
}
