// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The `gateway` binary: CLI parsing, logger init, config load, then
//! `Gateway::run`. `--test` runs a self-contained publish/subscribe
//! round-trip against the just-started Gateway and exits with its
//! result, standing in for scaproust's top-level `test/test.rs`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;

use messaging_mesh::{Connection, ConnectionParams, DispatchMode, FieldValue, Gateway, MeshConfig, Message};

/// Subject-based publish/subscribe messaging gateway with mesh federation.
#[derive(Parser, Debug)]
#[command(name = "gateway", version, about)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 5050)]
    port: u16,

    /// Path to a mesh configuration file (spec §6).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run the internal self-test and exit.
    #[arg(long)]
    test: bool,

    /// Raise the default log level to debug.
    #[arg(long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    messaging_mesh::init_logging(args.verbose);

    let config = match &args.config {
        Some(path) => match MeshConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                log::error!("failed to load config {}: {err}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => MeshConfig::default(),
    };

    let gateway = match Gateway::run(args.port, config) {
        Ok(gateway) => gateway,
        Err(err) => {
            log::error!("failed to start gateway on port {}: {err}", args.port);
            return ExitCode::FAILURE;
        }
    };

    if args.test {
        return if self_test(gateway.port()) {
            log::info!("self-test passed");
            ExitCode::SUCCESS
        } else {
            log::error!("self-test failed");
            ExitCode::FAILURE
        };
    }

    log::info!("gateway running on port {}, press Ctrl+C to stop", gateway.port());
    loop {
        std::thread::park();
    }
}

/// A minimal end-to-end exercise of C7/C8: one client publishes, another
/// subscriber on the same service receives it with the right fields.
fn self_test(port: u16) -> bool {
    // Binding happens asynchronously on the Gateway's own loop (see
    // `Gateway::run`); give it a moment before dialing in.
    std::thread::sleep(Duration::from_millis(100));

    let (tx, rx) = mpsc::sync_channel::<Message>(1);

    let subscriber = match Connection::new(ConnectionParams {
        gateway_host: "127.0.0.1".into(),
        gateway_port: port,
        service: "selftest".into(),
        client_id: "self-test-subscriber".into(),
        dispatch_mode: DispatchMode::InlineCallback,
    }) {
        Ok(connection) => connection,
        Err(err) => {
            log::error!("self-test: subscriber failed to connect: {err}");
            return false;
        }
    };

    let _subscription = subscriber.subscribe("selftest.ping", move |_subject, _reply_subject, message| {
        let _ = tx.try_send(message);
    });

    let publisher = match Connection::new(ConnectionParams {
        gateway_host: "127.0.0.1".into(),
        gateway_port: port,
        service: "selftest".into(),
        client_id: "self-test-publisher".into(),
        dispatch_mode: DispatchMode::InlineCallback,
    }) {
        Ok(connection) => connection,
        Err(err) => {
            log::error!("self-test: publisher failed to connect: {err}");
            return false;
        }
    };

    let message = Message::new().with_field("greeting", FieldValue::Str("hello".into()));
    publisher.send_message("selftest.ping", message, "");

    match rx.recv_timeout(Duration::from_secs(5)) {
        Ok(received) => match received.get("greeting") {
            Some(FieldValue::Str(text)) if text == "hello" => true,
            other => {
                log::error!("self-test: unexpected payload: {other:?}");
                false
            }
        },
        Err(_) => {
            log::error!("self-test: no message received within 5s");
            false
        }
    }
}
