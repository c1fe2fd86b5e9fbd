mod common;

use std::sync::Arc;

use common::fixtures::{drain_until_terminal, test_context, test_registry};
use loomflow::event_loop::ThreadedEventLoop;
use loomflow::graph::{Edge, Graph, Node};
use loomflow::message::ProcessingMessage;
use loomflow::runner::WorkflowRunner;
use loomflow::types::{JobStatus, NodeStatus};
use serde_json::json;

fn progress_graph() -> Graph {
    Graph::new()
        .add_node(Node::new("worker", "test.Progress").with_property("total", json!(4)))
        .add_node(Node::new("out", "loomflow.control.Output"))
        .add_edge(Edge::new("e1", "worker", "out", "value"))
}

#[test]
fn sync_caller_streams_messages_while_job_runs() {
    let mut ctx = test_context(progress_graph());
    let receiver = ctx.message_receiver();
    let runner = WorkflowRunner::new(Arc::new(test_registry()));

    let event_loop = ThreadedEventLoop::new();
    let handle = event_loop.run_coroutine(async move { runner.run(&mut ctx).await });

    // The calling thread drains synchronously until the terminal message.
    let messages = drain_until_terminal(&receiver);
    let outcome = handle.join().unwrap().unwrap();

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(outcome.outputs["out"], json!("done"));

    let progress_ticks = messages
        .iter()
        .filter(|m| matches!(m, ProcessingMessage::NodeProgress(_)))
        .count();
    assert_eq!(progress_ticks, 4);
    assert!(messages.last().unwrap().is_terminal());

    event_loop.shutdown();
}

#[test]
fn async_caller_can_poll_the_same_stream() {
    let mut ctx = test_context(progress_graph());
    let receiver = ctx.message_receiver();
    let runner = WorkflowRunner::new(Arc::new(test_registry()));

    let event_loop = ThreadedEventLoop::new();
    let handle = event_loop.run_coroutine(async move { runner.run(&mut ctx).await });

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let messages = rt.block_on(async {
        let mut messages = Vec::new();
        loop {
            let message = receiver.pop_async().await.unwrap();
            let terminal = message.is_terminal();
            messages.push(message);
            if terminal {
                break;
            }
        }
        messages
    });

    let outcome = rt.block_on(handle.join_async()).unwrap().unwrap();
    assert_eq!(outcome.status, JobStatus::Completed);
    assert!(matches!(
        messages.last(),
        Some(ProcessingMessage::JobUpdate(u)) if u.status == JobStatus::Completed
    ));
}

#[test]
fn failed_run_surfaces_through_the_stream_and_the_handle() {
    let graph = Graph::new()
        .add_node(Node::new("bad", "test.Failing"))
        .add_node(Node::new("after", "test.Add"))
        .add_edge(Edge::new("e1", "bad", "after", "a"));

    let mut ctx = test_context(graph);
    let receiver = ctx.message_receiver();
    let runner = WorkflowRunner::new(Arc::new(test_registry()));

    let event_loop = ThreadedEventLoop::new();
    let handle = event_loop.run_coroutine(async move { runner.run(&mut ctx).await });

    let messages = drain_until_terminal(&receiver);
    let outcome = handle.join().unwrap().unwrap();

    assert_eq!(outcome.status, JobStatus::Failed);
    let failed_update = messages.iter().any(|m| {
        matches!(m, ProcessingMessage::NodeUpdate(u)
            if u.node_id == "bad" && u.status == NodeStatus::Failed)
    });
    assert!(failed_update);
    assert!(matches!(
        messages.last(),
        Some(ProcessingMessage::JobUpdate(u)) if u.status == JobStatus::Failed
    ));
}

#[test]
fn stream_encodes_to_ndjson_lines() {
    let mut ctx = test_context(progress_graph());
    let receiver = ctx.message_receiver();
    let runner = WorkflowRunner::new(Arc::new(test_registry()));

    let event_loop = ThreadedEventLoop::new();
    let handle = event_loop.run_coroutine(async move { runner.run(&mut ctx).await });

    let mut wire = String::new();
    for message in drain_until_terminal(&receiver) {
        wire.push_str(&message.to_ndjson_line().unwrap());
    }
    handle.join().unwrap().unwrap();

    let lines: Vec<&str> = wire.lines().collect();
    assert!(lines.len() >= 7, "expected full stream, got {lines:?}");
    for line in &lines {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(value["type"].is_string());
    }
    let last: serde_json::Value = serde_json::from_str(lines.last().unwrap()).unwrap();
    assert_eq!(last["type"], "job_update");
    assert_eq!(last["status"], "completed");
}
