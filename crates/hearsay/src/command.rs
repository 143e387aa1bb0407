//! Protocol commands and name-based dispatch

use crate::codec;
use crate::engine::GossipState;
use crate::error::{GossipError, Result};
use crate::node::Node;
use crate::scheduler::Task;
use std::collections::HashMap;

/// `ping self <id> <ip> <port> <version> [rumor ...]`
pub const PING: &str = "ping";
/// `ping-req self <...> peer <...> [rumor ...]`
pub const PING_REQ: &str = "ping-req";
/// `ack self <...> [rumor ...]`
pub const ACK: &str = "ack";

/// The closed set of protocol commands.
///
/// Every command validates its arguments in full, merges the trailing rumor
/// list (plus the sender's implied-ALIVE self fact), and then performs
/// exactly one protocol action. A command whose arguments fail to parse
/// aborts before any merge; it never partially mutates state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    PingReq,
    Ack,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => PING,
            Command::PingReq => PING_REQ,
            Command::Ack => ACK,
        }
    }

    pub(crate) fn run(&self, args: &[&[u8]], state: &mut GossipState) -> Result<()> {
        match self {
            Command::Ping => {
                let (sender, mut rumors) = parse_self_and_rumors(args)?;
                rumors.push(sender.clone());
                state.merge(rumors);
                state.send_ack(&sender);
            }
            Command::PingReq => {
                let (sender, peer, mut rumors) = parse_ping_req(args)?;
                rumors.push(sender.clone());
                state.merge(rumors);
                state.send_ping(&peer);
                state.register(Task::PingReqRelay {
                    requester: sender,
                    target: peer.id,
                });
            }
            Command::Ack => {
                let (sender, mut rumors) = parse_self_and_rumors(args)?;
                let sender_id = sender.id.clone();
                rumors.push(sender);
                state.merge(rumors);
                state.resolve_acked(&sender_id);
            }
        }
        Ok(())
    }
}

fn parse_self_and_rumors(args: &[&[u8]]) -> Result<(Node, Vec<Node>)> {
    let mut pos = 0;
    let sender = codec::parse_node(codec::SELF_TAG, args, &mut pos, false)?;
    let rumors = codec::parse_rumors(args, &mut pos)?;
    Ok((sender, rumors))
}

fn parse_ping_req(args: &[&[u8]]) -> Result<(Node, Node, Vec<Node>)> {
    let mut pos = 0;
    let sender = codec::parse_node(codec::SELF_TAG, args, &mut pos, false)?;
    let peer = codec::parse_node(codec::PEER_TAG, args, &mut pos, false)?;
    let rumors = codec::parse_rumors(args, &mut pos)?;
    Ok((sender, peer, rumors))
}

/// Registry mapping command names to commands.
///
/// Registering two commands under the same name is fatal at startup.
#[derive(Debug, Clone, Default)]
pub(crate) struct CommandTable {
    commands: HashMap<&'static str, Command>,
}

impl CommandTable {
    /// Build the table with the protocol's command set.
    pub(crate) fn with_protocol_commands() -> Result<Self> {
        let mut table = Self::default();
        table.register(Command::Ping)?;
        table.register(Command::PingReq)?;
        table.register(Command::Ack)?;
        Ok(table)
    }

    fn register(&mut self, command: Command) -> Result<()> {
        if self.commands.insert(command.name(), command).is_some() {
            return Err(GossipError::DuplicateRegistration(command.name().into()));
        }
        Ok(())
    }

    pub(crate) fn lookup(&self, name: &[u8]) -> Option<Command> {
        std::str::from_utf8(name)
            .ok()
            .and_then(|name| self.commands.get(name).copied())
    }
}
