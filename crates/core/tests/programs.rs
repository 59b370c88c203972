//! Running node programs on built networks.

mod common;

use std::{cell::RefCell, rc::Rc};

use netbuilder::{
    egp::EgpError,
    qlink::{ErrorCode, ReqCreateAndKeep, ReqReceive, ResCreateAndKeep, ResError},
    NetworkBuilder, NetworkError, Program, ProtocolContext, TopologyConfig,
};
use testresult::TestResult;

type Log<T> = Rc<RefCell<Vec<T>>>;

/// Asks `peer` for `number` pairs and records them, then reports over the
/// classical channel.
fn requester(peer: &'static str, number: u32, log: Log<ResCreateAndKeep>) -> Box<dyn Program> {
    Box::new(move |ctx: ProtocolContext| async move {
        let remote = ctx.node_id(peer).expect("peer registered");
        let egp = ctx.egp(peer).expect("EGP towards peer").clone();
        let create_id = egp
            .put(ReqCreateAndKeep::new(remote, number))
            .expect("request accepted");
        for _ in 0..number {
            let pair = egp.next_pair().await.expect("pair delivered");
            assert_eq!(Some(pair.create_id), create_id);
            log.borrow_mut().push(pair);
        }
        if let Some(port) = ctx.port(peer) {
            port.send(format!("{number} pairs"));
        }
    })
}

/// Accepts pairs from every peer in `peers`, `number` from each.
fn receiver(
    peers: &'static [&'static str],
    number: u32,
    log: Log<ResCreateAndKeep>,
) -> Box<dyn Program> {
    Box::new(move |ctx: ProtocolContext| async move {
        let egps: Vec<_> = peers
            .iter()
            .map(|peer| {
                let egp = ctx.egp(peer).expect("EGP towards peer").clone();
                let remote = ctx.node_id(peer).expect("peer registered");
                egp.put(ReqReceive::new(remote)).expect("receive accepted");
                egp
            })
            .collect();
        for egp in egps {
            for _ in 0..number {
                let pair = egp.next_pair().await.expect("pair delivered");
                log.borrow_mut().push(pair);
            }
        }
    })
}

// =============================================================================
// Direct links
// =============================================================================

#[test_log::test]
fn alice_and_bob_share_pairs() -> TestResult {
    let config = common::alice_bob(r#"kind = "perfect""#);
    let mut network = NetworkBuilder::with_defaults().build(&config)?;
    let alice_pairs: Log<ResCreateAndKeep> = Default::default();
    let bob_pairs: Log<ResCreateAndKeep> = Default::default();
    let message: Rc<RefCell<Option<(String, u64)>>> = Default::default();

    let bob = {
        let bob_pairs = bob_pairs.clone();
        let message = message.clone();
        Box::new(move |ctx: ProtocolContext| async move {
            receiver(&["Alice"], 2, bob_pairs).run(ctx.clone()).await;
            let received = ctx.port("Alice").expect("port").recv().await.expect("message");
            *message.borrow_mut() = Some((received.to_string(), ctx.now()));
        }) as Box<dyn Program>
    };

    let stats = netbuilder::run(
        &mut network,
        [("Alice", requester("Bob", 2, alice_pairs.clone())), ("Bob", bob)],
    )?;
    assert_eq!(stats.tasks_completed, 2);
    assert_eq!(stats.tasks_pending, 0);

    let alice_pairs = alice_pairs.borrow();
    let bob_pairs = bob_pairs.borrow();
    assert_eq!(alice_pairs.len(), 2);
    assert_eq!(bob_pairs.len(), 2);
    assert_eq!(
        alice_pairs.iter().map(|p| (p.sequence_number, p.time)).collect::<Vec<_>>(),
        vec![(0, 1_000), (1, 2_000)]
    );
    for (local, remote) in alice_pairs.iter().zip(bob_pairs.iter()) {
        assert_eq!(local.create_id, remote.create_id);
        assert_eq!(local.time, remote.time);
        assert_eq!(local.remote_node_id, network.node_ids().id("Bob").ok_or("Bob")?);
        assert_eq!(remote.remote_node_id, network.node_ids().id("Alice").ok_or("Alice")?);
    }
    assert_eq!(
        alice_pairs.iter().map(|p| p.logical_qubit_id).collect::<Vec<_>>(),
        vec![0, 1]
    );
    assert_eq!(*message.borrow(), Some(("2 pairs".to_string(), 2_000)));

    let link = network.link("Alice", "Bob").ok_or("no link")?.borrow().stats();
    assert_eq!(link.pairs_delivered, 2);
    assert_eq!(link.requests_completed, 1);
    assert_eq!(network.controller().is_running("link_Alice_Bob"), Some(false));
    Ok(())
}

#[test]
fn exhausted_attempts_report_timeout() -> TestResult {
    let config = common::alice_bob(
        "kind = \"heralded\"\nconfig = { p_success = 0.0, max_attempts = 3, t_cycle = 100 }",
    );
    let mut network = NetworkBuilder::with_defaults().build(&config)?;
    let errors: Log<ResError> = Default::default();

    let alice = {
        let errors = errors.clone();
        Box::new(move |ctx: ProtocolContext| async move {
            let bob = ctx.node_id("Bob").expect("Bob");
            let egp = ctx.egp("Bob").expect("EGP").clone();
            egp.put(ReqCreateAndKeep::new(bob, 1)).expect("request accepted");
            errors.borrow_mut().push(egp.next_error().await.expect("error signal"));
        }) as Box<dyn Program>
    };
    let bob = Box::new(|ctx: ProtocolContext| async move {
        let alice = ctx.node_id("Alice").expect("Alice");
        ctx.egp("Alice")
            .expect("EGP")
            .put(ReqReceive::new(alice))
            .expect("receive accepted");
    }) as Box<dyn Program>;

    netbuilder::run(&mut network, [("Alice", alice), ("Bob", bob)])?;

    let errors = errors.borrow();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, ErrorCode::Timeout);
    assert_eq!(errors[0].time, 300);
    let stats = network.link("Bob", "Alice").ok_or("no link")?.borrow().stats();
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.requests_failed, 1);
    assert_eq!(stats.pairs_delivered, 0);
    Ok(())
}

#[test]
fn full_memory_fails_the_request() -> TestResult {
    let config = TopologyConfig::from_toml_str(
        r#"
        [[stacks]]
        name = "Alice"
        qdevice = { kind = "nv" }

        [[stacks]]
        name = "Bob"
        qdevice = { kind = "nv" }

        [[links]]
        nodes = ["Alice", "Bob"]
        kind = "perfect"
        "#,
    )?;
    let mut network = NetworkBuilder::with_defaults().build(&config)?;
    let errors: Log<ResError> = Default::default();
    let pairs: Log<ResCreateAndKeep> = Default::default();

    let alice = {
        let (errors, pairs) = (errors.clone(), pairs.clone());
        Box::new(move |ctx: ProtocolContext| async move {
            let bob = ctx.node_id("Bob").expect("Bob");
            let egp = ctx.egp("Bob").expect("EGP").clone();
            egp.put(ReqCreateAndKeep::new(bob, 2)).expect("request accepted");
            pairs.borrow_mut().push(egp.next_pair().await.expect("first pair"));
            errors.borrow_mut().push(egp.next_error().await.expect("error signal"));
        }) as Box<dyn Program>
    };

    netbuilder::run(
        &mut network,
        [("Alice", alice), ("Bob", receiver(&["Alice"], 1, Default::default()))],
    )?;

    assert_eq!(pairs.borrow().len(), 1);
    let errors = errors.borrow();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, ErrorCode::OutOfMemory);
    assert_eq!(errors[0].time, 2_000);
    Ok(())
}

#[test]
fn requests_need_a_running_network() -> TestResult {
    let config = common::alice_bob(r#"kind = "perfect""#);
    let mut network = NetworkBuilder::with_defaults().build(&config)?;
    let bob = network.node_ids().id("Bob").ok_or("Bob")?;
    let egp = network.egp("Alice", "Bob").ok_or("no EGP")?.clone();
    assert!(matches!(
        egp.put(ReqCreateAndKeep::new(bob, 1)),
        Err(EgpError::NotRunning(_))
    ));

    let err = netbuilder::run(
        &mut network,
        [("Mallory", requester("Bob", 1, Default::default()))],
    )
    .expect_err("unknown node");
    assert!(matches!(err, NetworkError::UnknownNode(ref name) if name == "Mallory"));
    assert_eq!(network.controller().is_running("link_Alice_Bob"), Some(false));

    network.start()?;
    let alice = network.node_ids().id("Alice").ok_or("Alice")?;
    assert!(matches!(
        egp.put(ReqCreateAndKeep::new(alice, 1)),
        Err(EgpError::WrongPeer { .. })
    ));
    assert!(matches!(
        egp.put(ReqCreateAndKeep::new(bob, 0)),
        Err(EgpError::EmptyRequest)
    ));
    network.stop()?;
    Ok(())
}

#[test]
fn same_seed_same_history() -> TestResult {
    let config = common::alice_bob(
        "kind = \"depolarise\"\nconfig = { prob_success = 0.2, t_cycle = 10 }",
    );
    let times = |seed: u64| -> Result<Vec<u64>, Box<dyn std::error::Error>> {
        let mut network = NetworkBuilder::with_defaults().with_seed(seed).build(&config)?;
        let pairs: Log<ResCreateAndKeep> = Default::default();
        netbuilder::run(
            &mut network,
            [
                ("Alice", requester("Bob", 2, pairs.clone())),
                ("Bob", receiver(&["Alice"], 2, Default::default())),
            ],
        )?;
        let times = pairs.borrow().iter().map(|p| p.time).collect();
        Ok(times)
    };
    let first = times(42)?;
    assert_eq!(first.len(), 2);
    assert_eq!(first, times(42)?);
    Ok(())
}

// =============================================================================
// Hubs
// =============================================================================

#[test_log::test]
fn fifo_hub_serves_requests_in_arrival_order() -> TestResult {
    let config = common::hub(
        &["Alice", "Bob", "Charlie"],
        r#"{ kind = "fifo", config = { switch_time = 100, max_multiplexing = 1 } }"#,
    );
    let mut network = NetworkBuilder::with_defaults().build(&config)?;
    let alice_pairs: Log<ResCreateAndKeep> = Default::default();
    let charlie_pairs: Log<ResCreateAndKeep> = Default::default();

    netbuilder::run(
        &mut network,
        [
            ("Alice", requester("Bob", 1, alice_pairs.clone())),
            ("Bob", receiver(&["Alice", "Charlie"], 1, Default::default())),
            ("Charlie", requester("Bob", 1, charlie_pairs.clone())),
        ],
    )?;

    // switch, then one attempt; Charlie waits for Alice's slot to close
    assert_eq!(alice_pairs.borrow()[0].time, 1_100);
    assert_eq!(charlie_pairs.borrow()[0].time, 2_200);

    let scheduler = network.scheduler("metro").ok_or("no scheduler")?.borrow();
    let slots: Vec<_> = scheduler
        .reservations()
        .iter()
        .map(|r| (r.slot.pair().to_string(), r.slot.start, r.slot.end))
        .collect();
    assert_eq!(
        slots,
        vec![
            ("Alice<->Bob".to_string(), 100, Some(1_100)),
            ("Bob<->Charlie".to_string(), 1_200, Some(2_200)),
        ]
    );
    Ok(())
}

#[test]
fn static_hub_generates_inside_windows() -> TestResult {
    let config = common::hub(
        &["Alice", "Bob", "Charlie"],
        r#"{ kind = "static", config = { time_window = 10000, switch_time = 0 } }"#,
    );
    let mut network = NetworkBuilder::with_defaults().build(&config)?;
    let alice_pairs: Log<ResCreateAndKeep> = Default::default();
    let charlie_pairs: Log<ResCreateAndKeep> = Default::default();

    let stats = netbuilder::run(
        &mut network,
        [
            ("Alice", requester("Bob", 1, alice_pairs.clone())),
            ("Bob", receiver(&["Alice", "Charlie"], 1, Default::default())),
            ("Charlie", requester("Bob", 1, charlie_pairs.clone())),
        ],
    )?;

    // windows: Alice<->Bob [0, 10000), Alice<->Charlie [10000, 20000),
    // Bob<->Charlie [20000, 30000)
    assert_eq!(alice_pairs.borrow()[0].time, 1_000);
    assert_eq!(charlie_pairs.borrow()[0].time, 21_000);
    // the timetable goes idle at the next cycle boundary
    assert_eq!(stats.end_time, 30_000);
    assert_eq!(stats.tasks_pending, 0);
    Ok(())
}

#[test]
fn static_window_of_exactly_one_attempt_completes() -> TestResult {
    let config = common::hub(
        &["Alice", "Bob"],
        r#"{ kind = "static", config = { time_window = 1000 } }"#,
    );
    let mut network = NetworkBuilder::with_defaults().build(&config)?;
    let alice_pairs: Log<ResCreateAndKeep> = Default::default();

    let stats = netbuilder::run(
        &mut network,
        [
            ("Alice", requester("Bob", 2, alice_pairs.clone())),
            ("Bob", receiver(&["Alice"], 2, Default::default())),
        ],
    )?;

    let times: Vec<u64> = alice_pairs.borrow().iter().map(|pair| pair.time).collect();
    assert_eq!(times, vec![1_000, 2_000]);
    assert_eq!(stats.tasks_pending, 0);
    let scheduler = network.scheduler("metro").ok_or("no scheduler")?;
    assert_eq!(scheduler.borrow().active_requests(), 0);
    Ok(())
}

// =============================================================================
// Repeater chains
// =============================================================================

#[test]
fn chain_end_nodes_talk_over_summed_delay() -> TestResult {
    let config = TopologyConfig::from_toml_str(&format!(
        r#"{stacks}
[[repeater_chains]]
name = "line"
end_nodes = ["Alice", "Bob"]
num_repeaters = 2
repeater_qdevice = {{ kind = "generic" }}
link = {{ kind = "perfect" }}
clink = {{ kind = "default", config = {{ length = 20.0 }} }}
"#,
        stacks = common::stacks(&["Alice", "Bob"]),
    ))?;
    let mut network = NetworkBuilder::with_defaults().build(&config)?;
    assert!(network.egp("Alice", "Bob").is_none());
    let repeater = network.protocol_context("line_repeater_0")?;
    assert_eq!(
        repeater.ports.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["Alice", "line_repeater_1"]
    );

    let arrival: Rc<RefCell<Option<u64>>> = Default::default();
    let alice = Box::new(|ctx: ProtocolContext| async move {
        ctx.port("Bob").expect("end-to-end port").send("hello");
    }) as Box<dyn Program>;
    let bob = {
        let arrival = arrival.clone();
        Box::new(move |ctx: ProtocolContext| async move {
            let message = ctx.port("Alice").expect("port").recv().await.expect("message");
            assert_eq!(message.as_str(), Some("hello"));
            *arrival.borrow_mut() = Some(ctx.now());
        }) as Box<dyn Program>
    };
    netbuilder::run(&mut network, [("Alice", alice), ("Bob", bob)])?;

    // three hops of 20 km each
    assert_eq!(*arrival.borrow(), Some(300_000));
    Ok(())
}
