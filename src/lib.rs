// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! A subject-based publish/subscribe messaging gateway with mesh
//! federation. A `Gateway` accepts client connections and mesh-peer
//! connections on one port, routes each `Service` through its own
//! dedicated event loop, and relays matching publishes across a mesh of
//! peer Gateways. Applications reach it through [`client::Connection`].

mod client;
mod config;
mod error;
mod event_loop;
mod frame;
mod gateway;
mod logging;
mod matcher;
mod mesh;
mod message;
mod service;
mod socket;
mod subject;
mod wire;

pub use client::{
    Connection, ConnectionParams, DispatchMode, MessageQueueInfo, Subscription, SubscriptionCallback,
};
pub use config::{MeshConfig, StartupMesh};
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use logging::init as init_logging;
pub use message::{Field, FieldValue, Message};
