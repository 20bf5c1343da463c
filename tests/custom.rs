//! Custom composites: conditional branching and child re-entry.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use branchwork::prelude::*;
use common::*;
use rustc_hash::FxHashMap;
use serde_json::json;

/// Classifies via one child, then routes to the matching responder.
struct RouteOnKind;

#[async_trait]
impl CustomRoutine for RouteOnKind {
    async fn drive(&self, ctx: &mut CustomContext<'_>) -> Result<(), UnitError> {
        ctx.run_child("classify").await?;
        let kind = ctx.require("kind")?;
        let target = if kind == json!("es") { "spanish" } else { "english" };
        ctx.run_child(target).await?;
        Ok(())
    }
}

fn router(kind: &str) -> Arc<dyn WorkUnit> {
    Arc::new(
        Custom::new(
            "router",
            vec![
                set_value("classify", "kind", json!(kind)),
                say("spanish", "hola"),
                say("english", "hello"),
            ],
            RouteOnKind,
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn routines_branch_on_store_contents() {
    let runner = Runner::default();

    let id = runner.submit(router("es"), FxHashMap::default());
    runner.join(&id).await.unwrap();
    let snapshot = runner.snapshot(&id).unwrap();
    assert_eq!(texts(&snapshot.events), vec!["set kind", "hola"]);

    let id = runner.submit(router("en"), FxHashMap::default());
    runner.join(&id).await.unwrap();
    let snapshot = runner.snapshot(&id).unwrap();
    assert_eq!(texts(&snapshot.events), vec!["set kind", "hello"]);
}

/// Runs the same child twice in one invocation.
struct RunTwice;

#[async_trait]
impl CustomRoutine for RunTwice {
    async fn drive(&self, ctx: &mut CustomContext<'_>) -> Result<(), UnitError> {
        ctx.run_child("worker").await?;
        ctx.run_child("worker").await?;
        Ok(())
    }
}

#[tokio::test]
async fn a_child_may_be_re_invoked_within_one_invocation() {
    let root = Arc::new(
        Custom::new("repeater", vec![say("worker", "pass")], RunTwice).unwrap(),
    );
    let runner = Runner::default();
    let id = runner.submit(root, FxHashMap::default());
    let status = runner.join(&id).await.unwrap();
    assert_eq!(status, InvocationStatus::Completed);

    let snapshot = runner.snapshot(&id).unwrap();
    assert_eq!(texts(&snapshot.events), vec!["pass", "pass"]);
    // Each pass gets its own branch, so the log distinguishes them.
    assert_ne!(snapshot.events[0].branch, snapshot.events[1].branch);
}

/// Reacts to a failed child by running a fallback instead of aborting.
struct Fallback;

#[async_trait]
impl CustomRoutine for Fallback {
    async fn drive(&self, ctx: &mut CustomContext<'_>) -> Result<(), UnitError> {
        let outcome = ctx.run_child("primary").await?;
        if outcome.is_fatal() {
            ctx.run_child("backup").await?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn routines_see_child_failures_as_data() {
    let root = Arc::new(
        Custom::new(
            "resilient",
            vec![fail("primary", "down"), say("backup", "covered")],
            Fallback,
        )
        .unwrap(),
    );
    let runner = Runner::default();
    let id = runner.submit(root, FxHashMap::default());
    let status = runner.join(&id).await.unwrap();
    assert_eq!(status, InvocationStatus::Completed);

    let snapshot = runner.snapshot(&id).unwrap();
    assert_eq!(texts(&snapshot.events), vec!["covered"]);
}

/// Asks for a child that was never declared.
struct RunStranger;

#[async_trait]
impl CustomRoutine for RunStranger {
    async fn drive(&self, ctx: &mut CustomContext<'_>) -> Result<(), UnitError> {
        ctx.run_child("stranger").await?;
        Ok(())
    }
}

#[tokio::test]
async fn undeclared_children_fail_the_composite() {
    let root = Arc::new(
        Custom::new("strict", vec![say("known", "x")], RunStranger).unwrap(),
    );
    let runner = Runner::default();
    let id = runner.submit(root, FxHashMap::default());
    let status = runner.join(&id).await.unwrap();
    assert_eq!(status, InvocationStatus::Failed);

    let snapshot = runner.snapshot(&id).unwrap();
    match terminal_of(&snapshot.events) {
        TerminalKind::Failed { failures } => {
            assert!(failures[0].message.contains("stranger"));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}
