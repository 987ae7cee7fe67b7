//! The `Core` package every GMCP peer speaks.

use serde::{Deserialize, Serialize};

use crate::protocols::telnet::{
    gmcp::message::{MessageBody, MessageData, Package},
    telopt::TerminalSide,
};

pub const CORE_PACKAGE: &str = "Core";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreHello {
    pub client: String,
    pub version: String,
}

impl MessageBody for CoreHello {
    const ID: &'static str = "Core.Hello";
}

/// Replaces the full list of `"<package> <version>"` entries the client supports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoreSupportsSet(pub Vec<String>);

impl MessageBody for CoreSupportsSet {
    const ID: &'static str = "Core.Supports.Set";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoreSupportsAdd(pub Vec<String>);

impl MessageBody for CoreSupportsAdd {
    const ID: &'static str = "Core.Supports.Add";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoreSupportsRemove(pub Vec<String>);

impl MessageBody for CoreSupportsRemove {
    const ID: &'static str = "Core.Supports.Remove";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreKeepAlive {}

impl MessageBody for CoreKeepAlive {
    const ID: &'static str = "Core.KeepAlive";
}

/// Client ping, carrying the client's last measured latency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorePing(pub i64);

impl MessageBody for CorePing {
    const ID: &'static str = "Core.Ping";
}

// Server reply to a ping. Same identifier, opposite direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorePingReply {}

impl MessageBody for CorePingReply {
    const ID: &'static str = "Core.Ping";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoreGoodbye(pub String);

impl MessageBody for CoreGoodbye {
    const ID: &'static str = "Core.Goodbye";
}

pub fn core_package() -> Package {
    Package::new(
        CORE_PACKAGE,
        1,
        vec![
            MessageData::of::<CoreHello>(TerminalSide::Client),
            MessageData::of::<CoreSupportsSet>(TerminalSide::Client),
            MessageData::of::<CoreSupportsAdd>(TerminalSide::Client),
            MessageData::of::<CoreSupportsRemove>(TerminalSide::Client),
            MessageData::of::<CoreKeepAlive>(TerminalSide::Client),
            MessageData::of::<CorePing>(TerminalSide::Client),
            MessageData::of::<CorePingReply>(TerminalSide::Server),
            MessageData::of::<CoreGoodbye>(TerminalSide::Server),
        ],
    )
}
