//! The routed unit of communication
//!
//! Every envelope carries a correlation id fixed at creation, a source and
//! destination path, and a direction flag. Replies are derived from the
//! request envelope so the id and the return path line up without the
//! replying cell knowing anything about topology.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::path::{CellAddress, CellPath};
use crate::messages::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Request,
    Reply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id; a reply carries the id of its request.
    pub uoid: Uuid,
    pub source: CellPath,
    pub destination: CellPath,
    pub direction: Direction,
    pub reply_required: bool,
    pub payload: Message,
}

impl Envelope {
    pub fn new(source: CellAddress, destination: CellPath, payload: Message) -> Self {
        let reply_required = payload.requires_reply();
        Envelope {
            uoid: Uuid::new_v4(),
            source: CellPath::to_address(source),
            destination,
            direction: Direction::Request,
            reply_required,
            payload,
        }
    }

    /// Derive the reply: same id, the reversed source as destination, the
    /// answering hop as source.
    pub fn into_reply(self, payload: Message) -> Envelope {
        debug_assert_eq!(self.direction, Direction::Request);
        Envelope {
            uoid: self.uoid,
            source: self.destination.terminal(),
            destination: self.source.reversed(),
            direction: Direction::Reply,
            reply_required: false,
            payload,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.direction == Direction::Reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_reverses_path_and_keeps_id() {
        let request = Envelope::new(
            CellAddress::new("door", "edge"),
            CellPath::parse("SpaceManager@core"),
            Message::Ping,
        );
        let uoid = request.uoid;
        assert!(request.reply_required);

        let reply = request.into_reply(Message::Pong);
        assert_eq!(reply.uoid, uoid);
        assert_eq!(reply.destination.current(), &CellAddress::new("door", "edge"));
        assert_eq!(reply.source.current(), &CellAddress::new("SpaceManager", "core"));
        assert!(reply.is_reply());
        assert!(!reply.reply_required);
    }
}
