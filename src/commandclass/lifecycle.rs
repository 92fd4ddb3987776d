//! No-operation, hail and wake-up classes.
//!
//! These classes carry no values of their own; they steer a node through
//! its initialization stages and its sleep cycle.

use tracing::{debug, info, warn};

use crate::controller::Outbox;
use crate::core::{Error, NodeId, Result};
use crate::node::{Node, NodeStage, QueryKey, StageEnv};
use crate::protocol::{Message, MessageClass, Priority};
use super::{class_command, ClassState, CommandClassKind};

const NO_OPERATION: u8 = 0x00;
const WAKE_UP: u8 = 0x84;

const HAIL_HAIL: u8 = 0x01;

const WAKE_UP_INTERVAL_SET: u8 = 0x04;
const WAKE_UP_INTERVAL_GET: u8 = 0x05;
const WAKE_UP_INTERVAL_REPORT: u8 = 0x06;
const WAKE_UP_NOTIFICATION: u8 = 0x07;
const WAKE_UP_NO_MORE_INFORMATION: u8 = 0x08;

/// Ping used to check that a node is reachable
pub fn no_operation(node: NodeId) -> Message {
    class_command(node, [NO_OPERATION], Some(MessageClass::SendData), Priority::Low)
}

pub fn wake_up_interval_get(node: NodeId) -> Message {
    class_command(
        node,
        [WAKE_UP, WAKE_UP_INTERVAL_GET],
        Some(MessageClass::ApplicationCommandHandler),
        Priority::Get,
    )
}

/// Sets the wake-up interval (seconds, 24 bits) and the node to notify
pub fn wake_up_interval_set(node: NodeId, interval: u32, target: NodeId) -> Message {
    let bytes = interval.to_be_bytes();
    class_command(
        node,
        [WAKE_UP, WAKE_UP_INTERVAL_SET, bytes[1], bytes[2], bytes[3], target.value()],
        Some(MessageClass::SendData),
        Priority::Set,
    )
}

/// Tells a woken node it may go back to sleep
pub fn wake_up_no_more_information(node: NodeId) -> Message {
    class_command(node, [WAKE_UP, WAKE_UP_NO_MORE_INFORMATION], Some(MessageClass::SendData), Priority::High)
}

fn is_no_more_information(message: &Message) -> bool {
    message.class == MessageClass::SendData
        && message.payload.get(2..4) == Some(&[WAKE_UP, WAKE_UP_NO_MORE_INFORMATION][..])
}

pub(crate) fn handle_no_operation(node: &mut Node, env: &mut StageEnv<'_>) -> Result<()> {
    node.advance(NodeStage::Details, env);
    Ok(())
}

pub(crate) fn handle_hail(node: &mut Node, data: &[u8], env: &mut StageEnv<'_>) -> Result<()> {
    match data.first() {
        Some(&HAIL_HAIL) => {
            debug!(node = %node.id(), "hail received");
            if node.stage() == NodeStage::Done {
                node.refresh(env);
            }
        }
        other => warn!(node = %node.id(), command = ?other, "unknown hail command"),
    }
    Ok(())
}

pub(crate) fn handle_wake_up(node: &mut Node, data: &[u8], env: &mut StageEnv<'_>) -> Result<()> {
    match data.first() {
        Some(&WAKE_UP_NOTIFICATION) => {
            info!(node = %node.id(), "node woke up");
            node.set_awake(true, env.outbox);
            if node.stage() == NodeStage::WakeUp {
                node.advance(NodeStage::Details, env);
            }
        }
        Some(&WAKE_UP_INTERVAL_REPORT) => {
            if data.len() < 5 {
                return Err(Error::protocol("wake up interval report too short"));
            }
            let seconds = u32::from_be_bytes([0, data[1], data[2], data[3]]);
            let target_node = NodeId(data[4]);
            if let Some(class) = node.command_class_mut(CommandClassKind::WakeUp) {
                if let ClassState::WakeUp { interval, target } = &mut class.state {
                    *interval = Some(seconds);
                    *target = Some(target_node);
                }
            }
            debug!(node = %node.id(), seconds, target = %target_node, "wake up interval");
            node.query_answered(QueryKey::new(1, CommandClassKind::WakeUp), env);
        }
        other => warn!(node = %node.id(), command = ?other, "unknown wake up command"),
    }
    Ok(())
}

/// Sleep handling once a transaction with a sleepy node has finished.
///
/// Sends "no more information" when nothing else is queued for the node,
/// and marks it asleep once that message went through.
pub(crate) fn after_transaction(node: &mut Node, completed: &Message, queued_for_node: usize, outbox: &mut Outbox) {
    if node.listening || node.frequently_listening || !node.supports(CommandClassKind::WakeUp) {
        return;
    }
    if is_no_more_information(completed) {
        debug!(node = %node.id(), "node went back to sleep");
        node.set_awake(false, outbox);
    } else if node.is_awake() && queued_for_node == 0 {
        outbox.send(wake_up_no_more_information(node.id()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commandclass::CommandClass;
    use crate::node::testing::Harness;

    fn sleepy_node() -> Node {
        let mut node = Node::new(NodeId(12), 0);
        node.add_command_class(CommandClass::new(CommandClassKind::WakeUp));
        node
    }

    #[test]
    fn test_interval_set_payload() {
        let msg = wake_up_interval_set(NodeId(12), 3600, NodeId(1));
        assert_eq!(msg.payload, vec![12, 6, 0x84, 0x04, 0x00, 0x0E, 0x10, 0x01]);
    }

    #[test]
    fn test_notification_wakes_node() {
        let mut harness = Harness::new();
        let mut node = sleepy_node();

        handle_wake_up(&mut node, &[WAKE_UP_NOTIFICATION], &mut harness.env()).unwrap();

        assert!(node.is_awake());
        assert!(harness.outbox.liveness_changed);
    }

    #[test]
    fn test_interval_report() {
        let mut harness = Harness::new();
        let mut node = sleepy_node();

        handle_wake_up(&mut node, &[WAKE_UP_INTERVAL_REPORT, 0x00, 0x0E, 0x10, 0x01], &mut harness.env()).unwrap();

        let class = node.command_class(CommandClassKind::WakeUp).unwrap();
        assert_eq!(
            class.state,
            ClassState::WakeUp { interval: Some(3600), target: Some(NodeId(1)) }
        );
    }

    #[test]
    fn test_sleep_cycle() {
        let mut outbox = Outbox::default();
        let mut node = sleepy_node();
        node.set_awake(true, &mut outbox);

        let done = no_operation(NodeId(12));
        after_transaction(&mut node, &done, 0, &mut outbox);
        assert_eq!(outbox.messages.len(), 1);
        assert!(is_no_more_information(&outbox.messages[0]));

        let goodbye = outbox.messages.remove(0);
        after_transaction(&mut node, &goodbye, 0, &mut outbox);
        assert!(!node.is_awake());
        assert!(outbox.messages.is_empty());
    }

    #[test]
    fn test_hail_refreshes_done_node() {
        let mut harness = Harness::new();
        let mut node = Node::new(NodeId(3), 0);
        node.add_command_class(CommandClass::new(CommandClassKind::SwitchBinary));
        node.force_stage(NodeStage::Done);

        handle_hail(&mut node, &[HAIL_HAIL], &mut harness.env()).unwrap();

        assert_eq!(node.stage(), NodeStage::Dynamic);
        assert_eq!(harness.outbox.messages.len(), 1);
        assert_eq!(harness.outbox.messages[0].payload, vec![3, 2, 0x25, 0x02]);
    }
}
