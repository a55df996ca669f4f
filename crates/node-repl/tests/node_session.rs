//! Integration tests against a real `node` process.
//!
//! Each test returns early when no usable node binary is on PATH.

use std::time::Duration;

use node_repl::backend::{Evaluator, NodeSession, SessionConfig};
use node_repl::executor::{Cell, CellExecutor};
use node_repl::tools;
use node_repl::EvalStatus;

async fn start_session(eval_timeout: Duration) -> Option<NodeSession> {
    let node = match tools::find_node(None).await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("skipping: {}", e);
            return None;
        }
    };
    let mut config = SessionConfig::new(node.path);
    config.eval_timeout = eval_timeout;
    Some(NodeSession::start(&config).await.unwrap())
}

#[tokio::test]
async fn test_expression_value_is_reported() {
    let Some(mut session) = start_session(Duration::from_secs(10)).await else {
        return;
    };

    let evaluation = session.evaluate("1+1").await.unwrap();
    assert_eq!(evaluation.status, EvalStatus::Ok);
    assert_eq!(evaluation.text, "2");

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bindings_persist_between_cells() {
    let Some(session) = start_session(Duration::from_secs(10)).await else {
        return;
    };
    let mut executor = CellExecutor::new(session);

    let records = executor
        .execute_cells(&[
            Cell::new("c1", "let x = 5;"),
            Cell::new("c2", "x + 1;"),
            Cell::new("c3", "const greet = (name) => `hi ${name}`;"),
            Cell::new("c4", "greet('node')"),
        ])
        .await;

    assert_eq!(records[0].output_text(), Some(""));
    assert_eq!(records[1].output_text(), Some("6"));
    assert_eq!(records[3].output_text(), Some("'hi node'"));
    assert!(records.iter().all(|r| r.success == Some(true)));

    executor.into_inner().shutdown().await.unwrap();
}

#[tokio::test]
async fn test_printed_output_is_trimmed() {
    let Some(session) = start_session(Duration::from_secs(10)).await else {
        return;
    };
    let mut executor = CellExecutor::new(session);

    let record = executor
        .execute_cell(&Cell::new("c1", "console.log('hi\\n')"))
        .await;
    assert_eq!(record.output_text(), Some("hi"));

    let record = executor
        .execute_cell(&Cell::new("c2", "console.log('a'); console.log('b'); 3"))
        .await;
    assert_eq!(record.output_text(), Some("a\nb\n3"));

    executor.into_inner().shutdown().await.unwrap();
}

#[tokio::test]
async fn test_thrown_error_is_contained() {
    let Some(session) = start_session(Duration::from_secs(10)).await else {
        return;
    };
    let mut executor = CellExecutor::new(session);

    let records = executor
        .execute_cells(&[
            Cell::new("c1", "let kept = 41;"),
            Cell::new("c2", "throw new Error(\"boom\")"),
            Cell::new("c3", "kept + 1"),
        ])
        .await;

    assert_eq!(records[1].success, Some(false));
    assert!(records[1].outputs[0].is_error());
    assert_eq!(records[1].output_text(), Some("Error: boom"));

    assert_eq!(records[2].success, Some(true));
    assert_eq!(records[2].output_text(), Some("42"));

    executor.into_inner().shutdown().await.unwrap();
}

#[tokio::test]
async fn test_incomplete_statement_does_not_hang() {
    let Some(mut session) = start_session(Duration::from_secs(10)).await else {
        return;
    };

    let evaluation = session.evaluate("function f() {").await.unwrap();
    assert_eq!(evaluation.status, EvalStatus::Incomplete);

    // The session is still usable afterwards
    let evaluation = session.evaluate("typeof f").await.unwrap();
    assert_eq!(evaluation.text, "'undefined'");

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runaway_loop_is_interrupted() {
    let Some(mut session) = start_session(Duration::from_millis(200)).await else {
        return;
    };

    let evaluation = session.evaluate("while (true) {}").await.unwrap();
    assert_eq!(evaluation.status, EvalStatus::Error);
    assert!(evaluation.text.contains("timed out"));

    let evaluation = session.evaluate("'still alive'").await.unwrap();
    assert_eq!(evaluation.status, EvalStatus::Ok);

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stream_writes_are_captured() {
    let Some(mut session) = start_session(Duration::from_secs(10)).await else {
        return;
    };

    // A partial line must not corrupt the reply that follows it
    let evaluation = session
        .evaluate("require('process').stdout.write('hi'); 1")
        .await
        .unwrap();
    assert_eq!(evaluation.status, EvalStatus::Ok);
    assert_eq!(evaluation.text, "hi\n1");

    let evaluation = session
        .evaluate(
            "const { stdout, stderr } = require('process'); \
             stdout.write('a\\n'); stderr.write('b\\n'); 2",
        )
        .await
        .unwrap();
    assert_eq!(evaluation.status, EvalStatus::Ok);
    assert_eq!(evaluation.text, "a\nb\n2");

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_late_output_stays_out_of_later_records() {
    let Some(session) = start_session(Duration::from_secs(10)).await else {
        return;
    };
    let mut executor = CellExecutor::new(session);

    let first = executor
        .execute_cell(&Cell::new(
            "c1",
            "setTimeout(() => console.log('late'), 0); \
             Promise.resolve().then(() => console.log('later')); 'one'",
        ))
        .await;
    assert_eq!(first.output_text(), Some("'one'"));

    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = executor.execute_cell(&Cell::new("c2", "'two'")).await;
    assert_eq!(second.output_text(), Some("'two'"));

    executor.into_inner().shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_call_is_an_error_not_incomplete() {
    let Some(mut session) = start_session(Duration::from_secs(10)).await else {
        return;
    };

    let evaluation = session.evaluate("console.log(1 2)").await.unwrap();
    assert_eq!(evaluation.status, EvalStatus::Error);
    assert!(evaluation.text.starts_with("SyntaxError"));

    session.shutdown().await.unwrap();
}
