// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! End-to-end scenarios driven over real loopback TCP sockets, mirroring
//! scaproust's `test/test.rs` (flat `#[test]` functions, one socket pair
//! per test, `env_logger::init()` at the top of each).

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use messaging_mesh::{
    Connection, ConnectionParams, DispatchMode, FieldValue, Gateway, MeshConfig, Message, StartupMesh,
};

static NEXT_PORT: AtomicU16 = AtomicU16::new(16050);

fn next_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::Relaxed)
}

fn start_gateway(port: u16, config: MeshConfig) -> Gateway {
    let gateway = Gateway::run(port, config).expect("gateway should bind");
    // Binding and mesh startup run asynchronously on the Gateway's own
    // loop (see `Gateway::run`); give it a moment before dialing in.
    std::thread::sleep(Duration::from_millis(100));
    gateway
}

fn connect(port: u16, service: &str, client_id: &str, mode: DispatchMode) -> Connection {
    let mut last_err = None;
    for _ in 0..20 {
        match Connection::new(ConnectionParams {
            gateway_host: "127.0.0.1".into(),
            gateway_port: port,
            service: service.into(),
            client_id: client_id.into(),
            dispatch_mode: mode,
        }) {
            Ok(connection) => return connection,
            Err(err) => {
                last_err = Some(err);
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
    panic!("connection to gateway on port {port} never succeeded: {last_err:?}");
}

fn int32_message(value: i32) -> Message {
    Message::new().with_field("qty", FieldValue::Int32(value))
}

#[test]
fn s1_exact_match_single_service() {
    let _ = env_logger::try_init();
    let port = next_port();
    let _gateway = start_gateway(port, MeshConfig::default());

    let (tx, rx) = mpsc::sync_channel::<Message>(1);
    let subscriber = connect(port, "orders", "A", DispatchMode::InlineCallback);
    let _sub = subscriber.subscribe("orders.new", move |_subject, _reply, message| {
        let _ = tx.try_send(message);
    });

    let publisher = connect(port, "orders", "B", DispatchMode::InlineCallback);
    publisher.send_message("orders.new", int32_message(5), "");

    let received = rx.recv_timeout(Duration::from_secs(5)).expect("A should receive the publish");
    assert_eq!(received.get("qty"), Some(&FieldValue::Int32(5)));
}

#[test]
fn s2_tail_wildcard() {
    let _ = env_logger::try_init();
    let port = next_port();
    let _gateway = start_gateway(port, MeshConfig::default());

    let (tx_a, rx_a) = mpsc::sync_channel::<String>(8);
    let (tx_b, rx_b) = mpsc::sync_channel::<String>(8);
    let (tx_c, rx_c) = mpsc::sync_channel::<String>(8);

    let a = connect(port, "orders", "A", DispatchMode::InlineCallback);
    let _sub_a = a.subscribe("orders.>", move |subject, _, _| {
        let _ = tx_a.try_send(subject.to_owned());
    });
    let b = connect(port, "orders", "B", DispatchMode::InlineCallback);
    let _sub_b = b.subscribe("orders.new", move |subject, _, _| {
        let _ = tx_b.try_send(subject.to_owned());
    });
    let c = connect(port, "orders", "C", DispatchMode::InlineCallback);
    let _sub_c = c.subscribe(">", move |subject, _, _| {
        let _ = tx_c.try_send(subject.to_owned());
    });

    let publisher = connect(port, "orders", "pub", DispatchMode::InlineCallback);

    publisher.send_message("orders.new", int32_message(1), "");
    assert_eq!(rx_a.recv_timeout(Duration::from_secs(2)).as_deref(), Ok("orders.new"));
    assert_eq!(rx_b.recv_timeout(Duration::from_secs(2)).as_deref(), Ok("orders.new"));
    assert_eq!(rx_c.recv_timeout(Duration::from_secs(2)).as_deref(), Ok("orders.new"));

    publisher.send_message("orders.new.eu", int32_message(2), "");
    assert_eq!(rx_a.recv_timeout(Duration::from_secs(2)).as_deref(), Ok("orders.new.eu"));
    assert!(rx_b.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(rx_c.recv_timeout(Duration::from_secs(2)).as_deref(), Ok("orders.new.eu"));

    publisher.send_message("orders", int32_message(3), "");
    assert!(rx_a.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(rx_b.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(rx_c.recv_timeout(Duration::from_secs(2)).as_deref(), Ok("orders"));
}

#[test]
fn s3_single_token_wildcard() {
    let _ = env_logger::try_init();
    let port = next_port();
    let _gateway = start_gateway(port, MeshConfig::default());

    let (tx, rx) = mpsc::sync_channel::<String>(8);
    let subscriber = connect(port, "svc", "A", DispatchMode::InlineCallback);
    let _sub = subscriber.subscribe("A.*.C", move |subject, _, _| {
        let _ = tx.try_send(subject.to_owned());
    });

    let publisher = connect(port, "svc", "pub", DispatchMode::InlineCallback);

    publisher.send_message("A.B.C", int32_message(1), "");
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).as_deref(), Ok("A.B.C"));

    publisher.send_message("A.C", int32_message(2), "");
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    publisher.send_message("A.B.C.D", int32_message(3), "");
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn s4_mesh_fan_out_no_loop() {
    let _ = env_logger::try_init();
    let port1 = next_port();
    let port2 = next_port();
    let mesh_gateways = vec![format!("127.0.0.1:{port1}"), format!("127.0.0.1:{port2}")];

    let config1 = MeshConfig {
        coordinator_gateway: None,
        startup_meshes: vec![StartupMesh {
            name: "svc".into(),
            discover_mesh_using_coordinator: false,
            mesh_gateways: mesh_gateways.clone(),
        }],
    };
    let config2 = MeshConfig {
        coordinator_gateway: None,
        startup_meshes: vec![StartupMesh {
            name: "svc".into(),
            discover_mesh_using_coordinator: false,
            mesh_gateways,
        }],
    };

    let _g1 = start_gateway(port1, config1);
    let _g2 = start_gateway(port2, config2);
    // Let the mesh peers finish dialing each other.
    std::thread::sleep(Duration::from_millis(300));

    let (tx_c1, rx_c1) = mpsc::sync_channel::<Message>(8);
    let c1 = connect(port1, "svc", "C1", DispatchMode::InlineCallback);
    let _sub_c1 = c1.subscribe("x.y", move |_, _, message| {
        let _ = tx_c1.try_send(message);
    });
    // Give the subscription time to propagate across the mesh link.
    std::thread::sleep(Duration::from_millis(200));

    let c2 = connect(port2, "svc", "C2", DispatchMode::InlineCallback);
    c2.send_message("x.y", int32_message(1), "");
    assert!(rx_c1.recv_timeout(Duration::from_secs(2)).is_ok());
    assert!(rx_c1.recv_timeout(Duration::from_millis(300)).is_err());

    let (tx_c2, rx_c2) = mpsc::sync_channel::<Message>(8);
    let _sub_c2 = c2.subscribe("x.y", move |_, _, message| {
        let _ = tx_c2.try_send(message);
    });
    std::thread::sleep(Duration::from_millis(200));

    c2.send_message("x.y", int32_message(2), "");
    assert!(rx_c1.recv_timeout(Duration::from_secs(2)).is_ok());
    assert_eq!(rx_c1.recv_timeout(Duration::from_millis(300)), Err(mpsc::RecvTimeoutError::Timeout));
    assert!(rx_c2.recv_timeout(Duration::from_secs(2)).is_ok());
    assert_eq!(rx_c2.recv_timeout(Duration::from_millis(300)), Err(mpsc::RecvTimeoutError::Timeout));
}

#[test]
fn s5_request_reply() {
    let _ = env_logger::try_init();
    let port = next_port();
    let _gateway = start_gateway(port, MeshConfig::default());

    let responder = Arc::new(Mutex::new(connect(port, "svc", "R2", DispatchMode::InlineCallback)));
    let responder_for_callback = responder.clone();
    let _sub = responder.lock().unwrap().subscribe("add", move |_subject, reply_subject, message| {
        let a = match message.get("a") {
            Some(FieldValue::Double(v)) => *v,
            _ => 0.0,
        };
        let b = match message.get("b") {
            Some(FieldValue::Double(v)) => *v,
            _ => 0.0,
        };
        let reply = Message::new().with_field("sum", FieldValue::Double(a + b));
        responder_for_callback.lock().unwrap().send_message(reply_subject, reply, "");
    });

    let requester = connect(port, "svc", "R1", DispatchMode::InlineCallback);
    let request = Message::new()
        .with_field("a", FieldValue::Double(1.5))
        .with_field("b", FieldValue::Double(2.5));

    let reply = requester
        .send_request("add", request, Duration::from_secs(5))
        .expect("reply should arrive within the timeout");
    assert_eq!(reply.get("sum"), Some(&FieldValue::Double(4.0)));
}

#[test]
fn s6_unsubscribe_on_drop() {
    let _ = env_logger::try_init();
    let port = next_port();
    let _gateway = start_gateway(port, MeshConfig::default());

    let (tx, rx) = mpsc::sync_channel::<Message>(8);
    let subscriber = connect(port, "svc", "A", DispatchMode::InlineCallback);
    let handle = subscriber.subscribe("t", move |_, _, message| {
        let _ = tx.try_send(message);
    });

    let publisher = connect(port, "svc", "pub", DispatchMode::InlineCallback);
    publisher.send_message("t", int32_message(1), "");
    assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());

    drop(handle);
    // The unsubscribe control frame travels async; give it time to land
    // at the Gateway before publishing again.
    std::thread::sleep(Duration::from_millis(200));

    publisher.send_message("t", int32_message(2), "");
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn pull_queue_dispatch_mode_requires_process_message_queue() {
    let _ = env_logger::try_init();
    let port = next_port();
    let _gateway = start_gateway(port, MeshConfig::default());

    let (tx, rx) = mpsc::sync_channel::<Message>(8);
    let subscriber = connect(port, "svc", "A", DispatchMode::PullQueue);
    let _sub = subscriber.subscribe("t", move |_, _, message| {
        let _ = tx.try_send(message);
    });

    let publisher = connect(port, "svc", "pub", DispatchMode::InlineCallback);
    publisher.send_message("t", int32_message(7), "");

    // Nothing is dispatched until the application pulls the queue.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    let info = subscriber.process_message_queue(Duration::from_secs(2), -1);
    assert_eq!(info.messages_processed, 1);
    let received = rx.recv_timeout(Duration::from_secs(1)).expect("callback should have run during the drain");
    assert_eq!(received.get("qty"), Some(&FieldValue::Int32(7)));
}
