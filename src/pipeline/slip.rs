use crate::message::{Direction, Message, SuppressFlags};

/// Post-commit next hops. Computed once per committed message as plain data;
/// each hop runs in its own failure scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hop {
    RespondToSender,
    ForwardToPeer,
    ForwardToOwner,
    ReactLocally,
}

impl Hop {
    pub fn name(self) -> &'static str {
        match self {
            Hop::RespondToSender => "respond-to-sender",
            Hop::ForwardToPeer => "forward-to-peer",
            Hop::ForwardToOwner => "forward-to-owner",
            Hop::ReactLocally => "react-locally",
        }
    }
}

/// A response is generated for everything except responses themselves and
/// hints (the matcher channel has no response path).
pub fn should_respond(message: &Message) -> bool {
    !message.message_type.is_response_message() && message.direction != Direction::FromMatcher
}

/// Reactions are suppressed on messages a node generated itself to keep a
/// node from reacting to its own echoes.
pub fn is_reaction_allowed(flags: SuppressFlags) -> bool {
    !flags.reaction
}

pub fn should_forward_to_owner(flags: SuppressFlags) -> bool {
    !flags.forward_to_owner
}

pub fn should_forward_to_peer(flags: SuppressFlags) -> bool {
    !flags.forward_to_peer
}

/// The routing slip: which hops run for a committed message/response pair,
/// in order. `flags` are the message's suppression flags, possibly
/// overridden by the reaction handler.
pub fn routing_slip(message: &Message, response: Option<&Message>, flags: SuppressFlags) -> Vec<Hop> {
    let mut hops = Vec::new();
    match message.direction {
        Direction::FromOwner | Direction::FromSystem => {
            if response.is_some() {
                hops.push(Hop::RespondToSender);
            }
            if message.message_type.causes_outgoing_message() && should_forward_to_peer(flags) {
                hops.push(Hop::ForwardToPeer);
            }
            if is_reaction_allowed(flags) {
                hops.push(Hop::ReactLocally);
            }
        }
        Direction::FromPeer | Direction::FromExternal => {
            if response.is_some() {
                hops.push(Hop::RespondToSender);
            }
            if should_forward_to_owner(flags) {
                hops.push(Hop::ForwardToOwner);
            }
            if is_reaction_allowed(flags) {
                hops.push(Hop::ReactLocally);
            }
        }
        Direction::FromMatcher => {
            if should_forward_to_owner(flags) {
                hops.push(Hop::ForwardToOwner);
            }
            if is_reaction_allowed(flags) {
                hops.push(Hop::ReactLocally);
            }
        }
    }
    hops
}
