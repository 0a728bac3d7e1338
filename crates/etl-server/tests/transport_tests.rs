//! Integration tests for node-to-pod data exchange
//!
//! These tests verify:
//! - Streaming socket replies are matched by id, not arrival order
//! - Pipe transfers time out without wedging the channel
//! - Pull-mode callbacks round trip through the node API
//! - Late callbacks for a stopped pod are rejected

use bytes::Bytes;
use etl_common::types::{NodeId, PodStage};
use etl_server::etl::transport::StageOwner;
use reqwest::StatusCode;
use std::time::Duration;

mod helpers;

use helpers::{raw_spec, scripted, TestCluster};

#[tokio::test]
async fn test_socket_replies_out_of_order() {
    let tc = TestCluster::start(&["node-1"], scripted()).await;
    tc.cluster.create(&raw_spec("socket-etl", "ws")).await.unwrap();
    assert_eq!(tc.settled("socket-etl", "node-1").await, PodStage::Running);

    let cluster = tc.cluster.clone();
    let slow = tokio::spawn(async move {
        cluster
            .transform("socket-etl", &NodeId::new("node-1"), Bytes::from_static(b"sleep:500:slow"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fast = tc.transform("socket-etl", "node-1", b"fast").await.unwrap();
    assert_eq!(fast.as_ref(), b"FAST");
    assert!(!slow.is_finished(), "fast reply waited behind the slow one");

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow.as_ref(), b"SLOW");
}

#[tokio::test]
async fn test_concurrent_push_transfers() {
    let tc = TestCluster::start(&["node-1"], scripted()).await;
    tc.cluster.create(&raw_spec("push-etl", "hpush")).await.unwrap();
    tc.settled("push-etl", "node-1").await;

    let node = NodeId::new("node-1");
    let inputs: Vec<String> = (0..16).map(|i| format!("object-{i}")).collect();
    let outputs = futures::future::join_all(
        inputs
            .iter()
            .map(|input| tc.cluster.transform("push-etl", &node, Bytes::from(input.clone()))),
    )
    .await;

    for (input, output) in inputs.iter().zip(outputs) {
        assert_eq!(output.unwrap(), Bytes::from(input.to_ascii_uppercase()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_pipe_transfer_times_out() {
    let tc = TestCluster::start(&["node-1"], scripted()).await;
    let mut spec = raw_spec("pipe-etl", "io");
    spec.obj_timeout = Some("2s".into());
    tc.cluster.create(&spec).await.unwrap();
    assert_eq!(tc.settled("pipe-etl", "node-1").await, PodStage::Running);

    let started = tokio::time::Instant::now();
    let err = tc
        .transform("pipe-etl", "node-1", b"sleep:300000:never")
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "{err}");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(300), "{elapsed:?}");
}

#[tokio::test]
async fn test_pipe_transfers_are_sequential() {
    let tc = TestCluster::start(&["node-1"], scripted()).await;
    tc.cluster.create(&raw_spec("pipe-seq", "io")).await.unwrap();
    tc.settled("pipe-seq", "node-1").await;

    let node = NodeId::new("node-1");
    let (a, b) = tokio::join!(
        tc.cluster.transform("pipe-seq", &node, Bytes::from_static(b"sleep:100:first")),
        tc.cluster.transform("pipe-seq", &node, Bytes::from_static(b"second")),
    );
    assert_eq!(a.unwrap().as_ref(), b"FIRST");
    assert_eq!(b.unwrap().as_ref(), b"SECOND");
}

#[tokio::test]
async fn test_pull_round_trip_through_node_api() {
    let tc = TestCluster::start(&["node-1"], scripted()).await;
    tc.cluster.create(&raw_spec("pull-etl", "hpull")).await.unwrap();
    assert_eq!(tc.settled("pull-etl", "node-1").await, PodStage::Running);

    let out = tc.transform("pull-etl", "node-1", b"pulled").await.unwrap();
    assert_eq!(out.as_ref(), b"PULLED");
    assert!(tc.cluster.staging().is_empty());
}

#[tokio::test]
async fn test_late_pull_callback_is_conflict() {
    let tc = TestCluster::start(&["node-1"], scripted()).await;
    let owner = StageOwner::new("late-etl", "node-1");
    let staging = tc.cluster.staging();

    let live = staging.stage(&owner, Bytes::from_static(b"live")).unwrap();
    let client = reqwest::Client::new();
    let url = |id: u64| tc.url.join(&format!("v1/etl/objects/{id}")).unwrap();

    let response = client.get(url(live.0)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"live");

    // Each object is served once
    let response = client.get(url(live.0)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let late = staging.stage(&owner, Bytes::from_static(b"late")).unwrap();
    assert_eq!(staging.close_owner(&owner), 1);

    let response = client.get(url(late.0)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "LIFECYCLE_ERROR");
}

#[tokio::test]
async fn test_stopping_pull_pod_tombstones_pending_objects() {
    let tc = TestCluster::start(&["node-1"], scripted()).await;
    tc.cluster.create(&raw_spec("pull-stop", "hpull")).await.unwrap();
    tc.settled("pull-stop", "node-1").await;

    // Stage an object the way the pull channel does, then stop the pod
    let owner = StageOwner::new("pull-stop", "node-1");
    let pending = tc
        .cluster
        .staging()
        .stage(&owner, Bytes::from_static(b"pending"))
        .unwrap();
    tc.cluster.stop("pull-stop").await.unwrap();

    let response = reqwest::get(tc.url.join(&format!("v1/etl/objects/{}", pending.0)).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
