//! Multi-instance (v1) and multi-channel (v2) addressing

use tracing::{debug, warn};

use crate::core::{Error, NodeId, Result};
use crate::node::{Endpoint, Node, QueryKey, StageEnv};
use crate::protocol::{Message, MessageClass, Priority};
use super::{class_command, handle_incoming, CommandClass, CommandClassKind, COMMAND_CLASS_MARK};

const MULTI_INSTANCE: u8 = 0x60;

const MULTI_INSTANCE_GET: u8 = 0x04;
const MULTI_INSTANCE_REPORT: u8 = 0x05;
const MULTI_INSTANCE_ENCAP: u8 = 0x06;
const MULTI_CHANNEL_ENDPOINT_GET: u8 = 0x07;
const MULTI_CHANNEL_ENDPOINT_REPORT: u8 = 0x08;
const MULTI_CHANNEL_CAPABILITY_GET: u8 = 0x09;
const MULTI_CHANNEL_CAPABILITY_REPORT: u8 = 0x0A;
const MULTI_CHANNEL_ENCAP: u8 = 0x0D;

/// Asks how many instances of `class` the node has (v1)
pub fn instance_get(node: NodeId, class: CommandClassKind) -> Message {
    class_command(
        node,
        [MULTI_INSTANCE, MULTI_INSTANCE_GET, class.code()],
        Some(MessageClass::ApplicationCommandHandler),
        Priority::Get,
    )
}

/// Asks how many endpoints the node has (v2)
pub fn endpoint_get(node: NodeId) -> Message {
    class_command(
        node,
        [MULTI_INSTANCE, MULTI_CHANNEL_ENDPOINT_GET],
        Some(MessageClass::ApplicationCommandHandler),
        Priority::Get,
    )
}

/// Asks which classes an endpoint supports (v2)
pub fn capability_get(node: NodeId, endpoint: u8) -> Message {
    class_command(
        node,
        [MULTI_INSTANCE, MULTI_CHANNEL_CAPABILITY_GET, endpoint],
        Some(MessageClass::ApplicationCommandHandler),
        Priority::Get,
    )
}

/// `None` when the wrapped command no longer fits its length byte
fn rewrap(mut message: Message, header: &[u8]) -> Option<Message> {
    // payload is [node, length, class, command, ...]
    if message.payload.len() < 2 {
        return Some(message);
    }
    let inner: Vec<u8> = message.payload.split_off(2);
    let Ok(length) = u8::try_from(inner.len() + header.len()) else {
        warn!(node = %message.target_node, length = inner.len(), "command too long to encapsulate");
        return None;
    };
    message.payload.truncate(1);
    message.payload.push(length);
    message.payload.extend_from_slice(header);
    message.payload.extend_from_slice(&inner);
    Some(message)
}

/// Wraps a send-data command for instance `instance` (v1)
pub fn encapsulate_instance(message: Message, instance: u8) -> Option<Message> {
    rewrap(message, &[MULTI_INSTANCE, MULTI_INSTANCE_ENCAP, instance])
}

/// Wraps a send-data command for endpoint `endpoint` (v2)
pub fn encapsulate_endpoint(message: Message, endpoint: u8) -> Option<Message> {
    rewrap(message, &[MULTI_INSTANCE, MULTI_CHANNEL_ENCAP, 0x01, endpoint])
}

fn byte(data: &[u8], index: usize, what: &str) -> Result<u8> {
    data.get(index)
        .copied()
        .ok_or_else(|| Error::protocol(format!("multi instance {} too short", what)))
}

pub(crate) fn handle(node: &mut Node, data: &[u8], env: &mut StageEnv<'_>) -> Result<()> {
    let command = byte(data, 0, "command")?;
    match command {
        MULTI_INSTANCE_REPORT => {
            let code = byte(data, 1, "report")?;
            let instances = byte(data, 2, "report")? & 0x7F;
            let Some(kind) = CommandClassKind::from_code(code) else {
                debug!(node = %node.id(), class = code, "instance report for unknown class");
                return Ok(());
            };
            let id = node.id();
            match node.command_class_mut(kind) {
                Some(class) => class.instances = instances.max(1),
                None => warn!(node = %id, class = %kind, "instance report for unsupported class"),
            }
            debug!(node = %id, class = %kind, instances, "instance report");
            node.query_answered(QueryKey::new(1, kind), env);
        }
        MULTI_CHANNEL_ENDPOINT_REPORT => {
            let count = byte(data, 2, "endpoint report")? & 0x7F;
            debug!(node = %node.id(), count, "endpoint report");
            for endpoint in 1..=count {
                node.expect_query(QueryKey::new(endpoint, CommandClassKind::MultiInstance));
                env.outbox.send(capability_get(node.id(), endpoint));
            }
            node.query_answered(QueryKey::new(1, CommandClassKind::MultiInstance), env);
        }
        MULTI_CHANNEL_CAPABILITY_REPORT => {
            let id = byte(data, 1, "capability report")? & 0x7F;
            let generic = byte(data, 2, "capability report")?;
            let specific = byte(data, 3, "capability report")?;
            let mut endpoint = Endpoint::new(id, generic, specific);
            for &code in data[4..].iter().take_while(|&&c| c != COMMAND_CLASS_MARK) {
                match CommandClassKind::from_code(code) {
                    Some(kind) => endpoint.add_command_class(CommandClass::for_endpoint(kind, id)),
                    None => debug!(node = %node.id(), endpoint = id, class = code, "skipping unknown class"),
                }
            }
            debug!(node = %node.id(), endpoint = id, classes = endpoint.command_classes().count(), "endpoint capabilities");
            node.add_endpoint(endpoint);
            node.query_answered(QueryKey::new(id, CommandClassKind::MultiInstance), env);
        }
        MULTI_INSTANCE_ENCAP => {
            let instance = byte(data, 1, "encapsulation")?;
            let code = byte(data, 2, "encapsulation")?;
            match CommandClassKind::from_code(code) {
                Some(kind) => handle_incoming(node, kind, instance, &data[3..], env)?,
                None => warn!(node = %node.id(), class = code, "encapsulated command for unknown class"),
            }
        }
        MULTI_CHANNEL_ENCAP => {
            let source = byte(data, 1, "encapsulation")?;
            let code = byte(data, 3, "encapsulation")?;
            match CommandClassKind::from_code(code) {
                Some(kind) => handle_incoming(node, kind, source, &data[4..], env)?,
                None => warn!(node = %node.id(), class = code, "encapsulated command for unknown class"),
            }
        }
        other => warn!(node = %node.id(), command = other, "unknown multi instance command"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commandclass::ClassState;
    use crate::controller::Event;
    use crate::node::testing::Harness;

    #[test]
    fn test_encapsulation_layout() {
        let msg = crate::commandclass::switch::binary_get(NodeId(6));
        let wrapped = encapsulate_instance(msg.clone(), 2).unwrap();
        assert_eq!(wrapped.payload, vec![6, 5, 0x60, 0x06, 2, 0x25, 0x02]);

        let wrapped = encapsulate_endpoint(msg, 3).unwrap();
        assert_eq!(wrapped.payload, vec![6, 6, 0x60, 0x0D, 0x01, 3, 0x25, 0x02]);

        let long = crate::commandclass::send_data(NodeId(6), &[0x20; 253], None, Priority::Set).unwrap();
        assert!(encapsulate_instance(long, 2).is_none());
    }

    #[test]
    fn test_capability_report_creates_endpoint() {
        let mut harness = Harness::new();
        let mut node = Node::new(NodeId(6), 0);

        let report = [MULTI_CHANNEL_CAPABILITY_REPORT, 0x02, 0x10, 0x01, 0x25, 0x31, 0xEF, 0x20];
        handle(&mut node, &report, &mut harness.env()).unwrap();

        let endpoint = node.endpoint(2).unwrap();
        assert_eq!(endpoint.generic, 0x10);
        let class = endpoint.command_class(CommandClassKind::SwitchBinary).unwrap();
        assert_eq!(class.endpoint, Some(2));
        // unknown 0x31 skipped, controlled classes after the mark ignored
        assert_eq!(endpoint.command_classes().count(), 1);
    }

    #[test]
    fn test_channel_encap_routes_to_endpoint() {
        let mut harness = Harness::new();
        let mut node = Node::new(NodeId(6), 0);
        let mut endpoint = Endpoint::new(2, 0x10, 0x01);
        endpoint.add_command_class(CommandClass::for_endpoint(CommandClassKind::SwitchBinary, 2));
        node.add_endpoint(endpoint);

        let encap = [MULTI_CHANNEL_ENCAP, 0x02, 0x01, 0x25, 0x03, 0x00];
        handle(&mut node, &encap, &mut harness.env()).unwrap();

        let class = node.endpoint(2).unwrap().command_class(CommandClassKind::SwitchBinary).unwrap();
        assert_eq!(class.state, ClassState::SwitchBinary { on: Some(false) });
        assert!(matches!(
            harness.outbox.events.as_slice(),
            [Event::CommandClassValue { endpoint: 2, value: 0, .. }]
        ));
    }
}
