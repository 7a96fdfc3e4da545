//! The notification engine.
//!
//! Mutations mark covering observations pending; this module decides when
//! a pending (or pmax-overdue) observation actually fires, re-reads the
//! value from the store, encodes it with the observation's content format
//! and ships it with the next Observe sequence number.

use std::time::{Duration, Instant};

use codec::{
    coap::{Code, Message, MessageType},
    registry::DefinitionRegistry,
    serdes,
    value::decode_numeric,
};

use crate::{
    attributes::{AttributeStore, NotificationAttributes, ObserverSet},
    store::{ObjectStore, Origin},
    transport::Transport,
};

/// A fired notification, for relaying to the session handler.
#[derive(Debug, Clone)]
pub struct Emitted {
    pub path: String,
    pub sequence: u32,
}

fn numeric_value(
    registry: &DefinitionRegistry,
    store: &ObjectStore,
    path: &codec::path::Path,
) -> Option<f64> {
    let resource_id = path.resource_id()?;
    let definition = registry.lookup_resource(path.object_id(), resource_id)?;
    if !definition.resource_type.is_numeric() || definition.multiple() {
        return None;
    }

    let bytes = store
        .get_resource_instance(path.object_id(), path.object_instance_id()?, resource_id, 0)
        .ok()?;

    decode_numeric(definition.resource_type, bytes).ok()
}

/// Whether the configured thresholds let a changed value through.
fn thresholds_pass(
    attributes: &NotificationAttributes,
    last: Option<f64>,
    current: Option<f64>,
) -> bool {
    if attributes.gt.is_none() && attributes.lt.is_none() && attributes.step.is_none() {
        return true;
    }

    // Thresholds only constrain single numeric resources; everything else
    // ignores them.
    let (Some(last), Some(current)) = (last, current) else {
        return true;
    };

    if let Some(gt) = attributes.gt {
        if (last < gt) != (current < gt) {
            return true;
        }
    }

    if let Some(lt) = attributes.lt {
        if (last < lt) != (current < lt) {
            return true;
        }
    }

    if let Some(step) = attributes.step {
        if (current - last).abs() >= step {
            return true;
        }
    }

    false
}

/// Advance every observation. Returns the next deadline delay and the
/// notifications that fired.
pub fn tick<T: Transport>(
    now: Instant,
    registry: &DefinitionRegistry,
    store: &ObjectStore,
    attributes: &AttributeStore,
    observers: &mut ObserverSet,
    transport: &mut T,
) -> (Option<Duration>, Vec<Emitted>) {
    let mut next: Option<Duration> = None;
    let mut emitted = Vec::new();

    let mut push_deadline = |slot: &mut Option<Duration>, delay: Duration| {
        *slot = Some(slot.map_or(delay, |existing| existing.min(delay)));
    };

    for observation in observers.iter_mut() {
        let resolved = attributes.resolve(&observation.path);

        let pmin = Duration::from_secs(resolved.pmin.unwrap_or(0) as u64);
        let pmin_ok = observation
            .last_emit
            .map(|at| now >= at + pmin)
            .unwrap_or(true);

        let pmax_due = match (resolved.pmax, observation.last_emit) {
            (Some(pmax), Some(at)) => now >= at + Duration::from_secs(pmax as u64),
            _ => false,
        };

        let current = numeric_value(registry, store, &observation.path);

        let fire = pmax_due
            || (observation.pending
                && pmin_ok
                && thresholds_pass(&resolved, observation.last_numeric, current));

        if fire {
            let Ok(node) = store.read_node(registry, Origin::Client, &observation.path) else {
                // The observed entity vanished; the observation dies with it.
                observation.pending = false;
                continue;
            };

            let Ok(payload) = serdes::encode(
                observation.format,
                &node,
                &observation.path,
                None,
            ) else {
                observation.pending = false;
                continue;
            };

            let sequence = observation.next_sequence();
            let mut message = Message::new(
                MessageType::NonConfirmable,
                Code::Content,
                rand::random::<u16>(),
            );
            message.set_token(&observation.token);
            message.set_observe(sequence);
            message.set_content_format(observation.format.into());
            message.set_payload(payload);

            if transport.send(observation.peer, message).is_ok() {
                emitted.push(Emitted {
                    path: observation.path.to_string(),
                    sequence,
                });
            }

            observation.last_emit = Some(now);
            observation.last_numeric = current;
            observation.pending = false;
        } else if observation.pending && !pmin_ok {
            if let Some(at) = observation.last_emit {
                push_deadline(&mut next, (at + pmin) - now);
            }
        }

        if let (Some(pmax), Some(at)) = (resolved.pmax, observation.last_emit) {
            let due = at + Duration::from_secs(pmax as u64);
            if due > now {
                push_deadline(&mut next, due - now);
            }
        }
    }

    (next, emitted)
}
