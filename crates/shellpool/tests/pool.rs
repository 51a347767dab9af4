//! End-to-end pool tests against real `/bin/sh` processes.

#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use shellpool::{
    CommandEvent, CommandResult, DoneCallback, PoolConfig, ShellError, ShellPool,
};

fn quiet() -> PoolConfig {
    PoolConfig {
        log: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn captures_output_and_exit_status() {
    let pool = ShellPool::new(quiet());
    let report = pool
        .create_command("printf HELLO;")
        .wait()
        .await
        .unwrap()
        .into_report()
        .unwrap();
    assert_eq!(report.output, "HELLO");
    assert_eq!(report.command, "printf HELLO;");
    assert!(report.is_success());

    let report = pool
        .create_command("false;")
        .wait()
        .await
        .unwrap()
        .into_report()
        .unwrap();
    assert_eq!(report.error, Some(ShellError::NonZeroStatus));
    pool.close();
}

#[tokio::test]
async fn lifecycle_events_arrive_in_order() {
    let pool = ShellPool::new(quiet());
    let mut handle = pool.create_command("printf HELLO;");
    let mut events = handle.events();
    handle.wait().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(CommandEvent::Enqueued)));
    assert!(matches!(seen.get(1), Some(CommandEvent::Executing)));
    assert!(matches!(seen.last(), Some(CommandEvent::Finished)));
    let data: String = seen
        .iter()
        .filter_map(|event| match event {
            CommandEvent::Data(chunk) => Some(chunk.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(data, "HELLO");
    pool.close();
}

#[tokio::test]
async fn pipelined_outputs_stay_attributed() {
    let pool = ShellPool::new(quiet());
    let handles: Vec<_> = (0..5)
        .map(|n| pool.create_command(format!("printf OUT{n};")))
        .collect();
    for (n, handle) in handles.into_iter().enumerate() {
        let report = handle.wait().await.unwrap().into_report().unwrap();
        assert_eq!(report.output, format!("OUT{n}"));
        assert!(report.is_success());
    }
    pool.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submissions_execute_in_fifo_order() {
    let pool = ShellPool::new(quiet());
    pool.start().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("order.log");
    // Back-to-back submissions must reach the shell in call order even when
    // the runtime schedules their admission tasks out of order.
    let handles: Vec<_> = (0..20)
        .map(|n| pool.create_command(format!("echo {n} >> {};", log.display())))
        .collect();
    for handle in handles {
        handle.wait().await.unwrap();
    }
    let recorded = std::fs::read_to_string(&log).unwrap();
    let expected: String = (0..20).map(|n| format!("{n}\n")).collect();
    assert_eq!(recorded, expected);
    pool.close();
}

#[tokio::test]
async fn concurrency_ceiling_of_one_serializes() {
    let pool = ShellPool::new(PoolConfig {
        concurrent_cmds: 1,
        ..quiet()
    });
    let first = pool.create_command("sleep 0.2; printf ONE;");
    let second = pool.create_command("sleep 0.2; printf TWO;");
    let started = Instant::now();
    assert_eq!(first.wait().await.unwrap().output(), Some("ONE"));
    let first_done = started.elapsed();
    assert_eq!(second.wait().await.unwrap().output(), Some("TWO"));
    let second_done = started.elapsed();
    // The second command is not transmitted until the first completes.
    assert!(
        second_done >= first_done + Duration::from_millis(150),
        "second finished too early: {first_done:?} vs {second_done:?}"
    );
    pool.close();
}

#[tokio::test]
async fn done_callbacks_override_results() {
    let pool_wide: DoneCallback = Arc::new(|report, _payload| {
        Box::pin(async move { json!({ "wrapped": report.output }) })
    });
    let pool = ShellPool::new(PoolConfig {
        done_callback: Some(pool_wide),
        ..quiet()
    });
    match pool.create_command("printf HELLO;").wait().await.unwrap() {
        CommandResult::Custom(value) => assert_eq!(value["wrapped"], "HELLO"),
        CommandResult::Report(report) => panic!("expected Custom, got {report:?}"),
    }

    // A per-command callback takes precedence and sees its payload.
    let per_command: DoneCallback =
        Arc::new(|_report, payload| Box::pin(async move { json!({ "payload": payload }) }));
    let handle = pool.create_command_with("printf IGNORED;", Some(json!(7)), Some(per_command));
    match handle.wait().await.unwrap() {
        CommandResult::Custom(value) => assert_eq!(value["payload"], 7),
        CommandResult::Report(report) => panic!("expected Custom, got {report:?}"),
    }
    pool.close();
}

#[tokio::test]
async fn broadcast_runs_on_every_process() {
    let pool = ShellPool::new(PoolConfig {
        number_of_processes: 5,
        ..quiet()
    });
    let results = pool.broadcast("printf $$;").await.unwrap();
    assert_eq!(results.len(), 5);
    let pids: HashSet<String> = results
        .into_iter()
        .map(|result| result.into_report().unwrap().output)
        .collect();
    // Five distinct shells answered.
    assert_eq!(pids.len(), 5);
    pool.close();
}

#[tokio::test]
async fn custom_marker_prefix_frames_correctly() {
    let pool = ShellPool::new(PoolConfig {
        done_marker: "~fin~".to_string(),
        ..quiet()
    });
    let report = pool
        .create_command("printf HELLO;")
        .wait()
        .await
        .unwrap()
        .into_report()
        .unwrap();
    assert_eq!(report.output, "HELLO");
    pool.close();
}

#[tokio::test]
async fn running_commands_tracks_in_flight_work() {
    let pool = ShellPool::new(quiet());
    pool.start().await.unwrap();
    assert_eq!(pool.running_commands(), 0);
    let handle = pool.create_command("sleep 0.3;");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.running_commands(), 1);
    handle.wait().await.unwrap();
    assert_eq!(pool.running_commands(), 0);
    pool.close();
}

#[tokio::test]
async fn close_cancels_in_flight_commands() {
    let pool = ShellPool::new(quiet());
    pool.start().await.unwrap();
    let handle = pool.create_command("sleep 5; printf LATE;");
    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.close();
    assert_eq!(handle.wait().await, Err(ShellError::Cancelled));

    // Closed pools reject new work.
    let rejected = pool.create_command("printf HELLO;");
    assert_eq!(rejected.wait().await, Err(ShellError::PoolClosed));
}
