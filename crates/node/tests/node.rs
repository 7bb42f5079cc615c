//! A node started from TOML, driven through a few consensus rounds.

use prometheus::Registry;
use std::time::Duration;
use tempfile::TempDir;
use tessera_node::{logging, Node, NodeConfig, NodeError};
use tessera_pipeline::{DetachedSnapshot, StateStorage};
use tessera_test_helpers::{event_in_round, from_peer};
use tessera_types::{AncientMode, AncientWindow};

fn config(dir: &TempDir) -> NodeConfig {
    let toml = format!(
        r#"
        [event]
        ancient_mode = "birth_round"

        [intake]
        queue_capacity = 64

        [state]
        max_unretired_copies = 4
        flush_interval = 2
        storage_dir = "{}"

        [logging]
        filter = "warn"
        "#,
        dir.path().join("state").display()
    );
    NodeConfig::from_toml_str(&toml).unwrap()
}

#[test]
fn test_node_runs_rounds_end_to_end() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    logging::init(&config.logging);

    let registry = Registry::new();
    let node = Node::start(config, &registry).unwrap();
    assert_eq!(registry.gather().len(), 3);

    for round in 1..=6u64 {
        for creator in 0..3 {
            let e = from_peer(event_in_round(creator, round), creator + 10);
            node.intake().submit(e.clone()).unwrap();
            node.intake().submit(e).unwrap();
        }
        node.intake().drain();

        node.state()
            .current()
            .put(format!("round-{round}"), round.to_le_bytes().to_vec());
        let window = AncientWindow::new(round, round.saturating_sub(2).max(1), AncientMode::BirthRound);
        node.on_consensus_round(window).unwrap();
    }

    // Each event was forwarded once; duplicates were dropped.
    let accepted: Vec<_> = node.events().try_iter().collect();
    assert_eq!(accepted.len(), 18);
    for e in &accepted {
        node.intake_event_counter()
            .event_exited_intake_pipeline(e.sender_id);
    }
    for peer in 10..13 {
        assert!(!node
            .intake_event_counter()
            .has_unprocessed_events(tessera_types::NodeId(peer)));
    }

    // Late gossip from a round that is now ancient never comes out.
    node.intake()
        .submit(from_peer(event_in_round(0, 2), 10))
        .unwrap();
    node.intake().drain();
    assert!(node.events().recv_timeout(Duration::from_millis(20)).is_err());

    // Copy 4 was flushed by policy.
    node.state().pipeline().wait_until_flushed(4).unwrap();

    let snapshot = dir.path().join("copy-5.json");
    node.state().detach(5, &snapshot).unwrap();
    let snapshot = DetachedSnapshot::read(&snapshot).unwrap();
    assert_eq!(snapshot.version, 5);
    assert_eq!(snapshot.entries.len(), 6);

    node.shutdown(false).unwrap();

    let storage = tessera_pipeline::FileStorage::open(dir.path().join("state")).unwrap();
    assert_eq!(storage.latest_version(), Some(4));
    assert_eq!(
        storage.get(b"round-5").unwrap(),
        Some(5u64.to_le_bytes().to_vec())
    );
}

#[test]
fn test_invalid_config_is_refused_at_start() {
    let config = NodeConfig::default().with_max_unretired_copies(1);
    assert!(matches!(
        Node::start(config, &Registry::new()),
        Err(NodeError::Config(_))
    ));
}

#[test]
fn test_metrics_cannot_be_registered_twice() {
    let registry = Registry::new();
    let _first = Node::start(NodeConfig::default(), &registry).unwrap();
    assert!(matches!(
        Node::start(NodeConfig::default(), &registry),
        Err(NodeError::Metrics(_))
    ));
}
