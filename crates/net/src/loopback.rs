//! In-process stream pairs.
//!
//! Each end's outbound queue is the other end's inbound queue, so a write on
//! one side is visible to the other without any socket or readiness event.

use std::rc::Rc;

use crate::stream::{Stream, StreamFlags, StreamId, StreamState, shared_queue};
use crate::table::SlotTable;

/// Builds the `(client, server)` records of a pair with crossed queues.
pub(crate) fn pair() -> (Stream, Stream) {
    let to_server = shared_queue();
    let to_client = shared_queue();

    let mut client = Stream::new();
    client.state = StreamState::Connected;
    client.flags.insert(StreamFlags::LOOPBACK);
    client.inbound = Some(Rc::clone(&to_client));
    client.outbound = Some(Rc::clone(&to_server));

    let mut server = Stream::new();
    server.state = StreamState::Connected;
    server.flags.insert(StreamFlags::LOOPBACK);
    server.inbound = Some(to_server);
    server.outbound = Some(to_client);

    (client, server)
}

pub(crate) fn link(streams: &mut SlotTable<Stream>, client: StreamId, server: StreamId) {
    if let Some(s) = streams.get_mut(client.0) {
        s.loopback_peer = Some(server);
    }
    if let Some(s) = streams.get_mut(server.0) {
        s.loopback_peer = Some(client);
    }
}

/// Stops `peer` from queueing anything more towards a departing stream.
pub(crate) fn stop_writes_from(streams: &mut SlotTable<Stream>, peer: StreamId) {
    if let Some(s) = streams.get_mut(peer.0) {
        s.outbound = None;
    }
}

/// Fully detaches `peer` from a stream that is closing.
pub(crate) fn detach(streams: &mut SlotTable<Stream>, peer: StreamId) {
    if let Some(s) = streams.get_mut(peer.0) {
        s.outbound = None;
        s.loopback_peer = None;
    }
}

/// A loopback stream whose peer is gone and whose inbound is drained has
/// nothing left to do. A finished stream is also done once the peer has
/// read everything it sent.
pub(crate) fn is_spent(stream: &Stream) -> bool {
    if stream.loopback_peer.is_none() {
        return stream.inbound_len() == 0;
    }
    stream.is_finished() && stream.outbound_len() == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_are_crossed() {
        let (client, server) = pair();

        if let Some(q) = &client.outbound {
            q.borrow_mut().append(b"ping");
        }
        assert_eq!(server.inbound_len(), 4);
        assert_eq!(client.inbound_len(), 0);

        if let Some(q) = &server.outbound {
            q.borrow_mut().append(b"pong!");
        }
        assert_eq!(client.inbound_len(), 5);
    }

    #[test]
    fn detached_survivor_keeps_delivered_bytes() {
        let mut streams = SlotTable::with_capacity(4);
        let (client, server) = pair();
        let client = StreamId(streams.insert(client).unwrap());
        let server = StreamId(streams.insert(server).unwrap());
        link(&mut streams, client, server);

        if let Some(q) = streams.get(client.0).and_then(|s| s.outbound.clone()) {
            q.borrow_mut().append(b"late");
        }

        streams.remove(client.0);
        detach(&mut streams, server);

        let survivor = streams.get(server.0).unwrap();
        assert!(survivor.loopback_peer.is_none());
        assert!(survivor.outbound.is_none());
        assert_eq!(survivor.inbound_len(), 4);
        assert!(!is_spent(survivor));
    }

    #[test]
    fn finished_end_is_spent_once_peer_drains() {
        let mut streams = SlotTable::with_capacity(2);
        let (client, server) = pair();
        let client = StreamId(streams.insert(client).unwrap());
        let server = StreamId(streams.insert(server).unwrap());
        link(&mut streams, client, server);

        let outbound = {
            let s = streams.get_mut(client.0).unwrap();
            s.flags.insert(StreamFlags::FINISHED);
            s.inbound = None;
            s.outbound.clone().unwrap()
        };
        outbound.borrow_mut().append(b"x");
        assert!(!is_spent(streams.get(client.0).unwrap()));

        outbound.borrow_mut().consume(1);
        assert!(is_spent(streams.get(client.0).unwrap()));
        assert!(!is_spent(streams.get(server.0).unwrap()));
    }
}
