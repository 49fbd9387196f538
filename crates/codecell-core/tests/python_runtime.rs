//! Integration tests against a real Python interpreter.

use std::time::{Duration, Instant};

use codecell_core::{
    CancellationToken, ExecutionService, ExecutionStatus, PythonConfig, RunOptions, ServiceConfig,
    html,
};

/// A service that only needs the standard library.
fn bare_service() -> ExecutionService<codecell_core::PythonRuntime> {
    let config = ServiceConfig {
        python: PythonConfig {
            packages: Vec::new(),
            ..PythonConfig::default()
        },
        ..ServiceConfig::default()
    };
    ExecutionService::python(config)
}

#[tokio::test]
#[ignore = "Requires python3 on PATH"]
async fn test_print_and_last_expression() {
    let service = bare_service();
    let output = service.run("print('hello')\n1 + 1").await.unwrap();

    assert_eq!(output.status, ExecutionStatus::Completed);
    assert_eq!(
        output.html,
        format!("{}{}", html::stream_output("hello"), html::text_output("2"))
    );
}

#[tokio::test]
#[ignore = "Requires python3 on PATH"]
async fn test_state_persists_between_runs() {
    let service = bare_service();
    service.run("x = 20").await.unwrap();
    let output = service.run("x * 2 + 2").await.unwrap();
    assert_eq!(output.html, html::text_output("42"));
}

#[tokio::test]
#[ignore = "Requires python3 on PATH"]
async fn test_exception_reports_user_line() {
    let service = bare_service();
    let output = service
        .run("a = 1\nb = 2\nraise ValueError('bad input')")
        .await
        .unwrap();

    assert_eq!(
        output.status,
        ExecutionStatus::Failed {
            line_number: Some(3),
            message: "ValueError: bad input".to_string(),
        }
    );
}

#[tokio::test]
#[ignore = "Requires python3 on PATH"]
async fn test_top_level_await() {
    let service = bare_service();
    let output = service
        .run("import asyncio\nawait asyncio.sleep(0)\n'done'")
        .await
        .unwrap();
    assert_eq!(output.html, html::text_output("'done'"));
}

#[tokio::test]
#[ignore = "Requires python3 on PATH"]
async fn test_interrupt_infinite_loop() {
    let service = bare_service();
    service.initialize().await.unwrap();

    let token = CancellationToken::new();
    let run = {
        let service = service.clone();
        let token = token.clone();
        tokio::spawn(async move {
            service
                .run_with(
                    "while True:\n    pass",
                    RunOptions::new().with_cancel(token),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let start = Instant::now();
    token.cancel();
    let output = run.await.unwrap().unwrap();
    assert_eq!(output.status, ExecutionStatus::Interrupted);
    assert!(start.elapsed() < Duration::from_secs(1));

    // The interpreter survives the interrupt.
    let after = service.run("'alive'").await.unwrap();
    assert_eq!(after.html, html::text_output("'alive'"));
}

#[tokio::test]
#[ignore = "Requires python3 on PATH"]
async fn test_writes_to_fd_one_keep_the_interpreter() {
    let service = bare_service();
    service.run("marker = 'kept'").await.unwrap();

    for code in [
        "import os\nos.system('echo hi')\n3",
        "import sys\nprint('x', file=sys.__stdout__)\n3",
    ] {
        let output = service.run(code).await.unwrap();
        assert_eq!(output.status, ExecutionStatus::Completed, "{}", code);
        assert!(output.html.ends_with(&html::text_output("3")), "{}", output.html);
    }

    let output = service.run("marker").await.unwrap();
    assert_eq!(output.html, html::text_output("'kept'"));
}

#[tokio::test]
#[ignore = "Requires python3 on PATH"]
async fn test_repeated_interrupts_always_settle() {
    let service = bare_service();
    service.initialize().await.unwrap();

    for round in 0..5 {
        let token = CancellationToken::new();
        let run = {
            let service = service.clone();
            let token = token.clone();
            tokio::spawn(async move {
                service
                    .run_with(
                        "n = 0\nwhile True:\n    n += 1\n    print(n)",
                        RunOptions::new().with_cancel(token),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50 + round * 20)).await;
        token.cancel();
        assert_eq!(
            run.await.unwrap().unwrap().status,
            ExecutionStatus::Interrupted
        );

        let after = tokio::time::timeout(Duration::from_secs(5), service.run("'alive'"))
            .await
            .expect("interpreter stalled after an interrupt")
            .unwrap();
        assert_eq!(after.html, html::text_output("'alive'"));
    }
}

#[tokio::test]
#[ignore = "Requires python3 with numpy, matplotlib, pandas and tqdm"]
async fn test_default_package_set() {
    let service = ExecutionService::python(ServiceConfig::default());

    let table = service
        .run("import pandas as pd\npd.DataFrame({'a': [1, 2]})")
        .await
        .unwrap();
    assert!(table.html.contains(r#"<div class="notebook-table-container">"#));

    let figure = service
        .run("import matplotlib.pyplot as plt\nplt.plot([1, 2, 3])\nNone")
        .await
        .unwrap();
    assert!(figure.html.contains(r#"<div class="notebook-image-output">"#));

    let progress = service
        .run("from tqdm import tqdm\nfor _ in tqdm(range(3)):\n    pass")
        .await
        .unwrap();
    assert!(progress.html.contains(r#"<pre class="notebook-tqdm-output">"#));
}

#[tokio::test]
#[ignore = "Requires python3 on PATH"]
async fn test_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("data.txt"), "from disk").unwrap();

    let config = ServiceConfig {
        python: PythonConfig {
            packages: Vec::new(),
            working_dir: Some(dir.path().to_path_buf()),
            ..PythonConfig::default()
        },
        ..ServiceConfig::default()
    };
    let service = ExecutionService::python(config);
    let output = service
        .run("print(open('data.txt').read())")
        .await
        .unwrap();
    assert_eq!(output.html, html::stream_output("from disk"));
}
