//! Routing control messages
//!
//! Acks and naks are ordinary decoded packets on the routing port carrying a
//! [`Routing`] message and the id of the packet they answer in
//! `request_id`. They only ever travel to immediate neighbors.
//!
//! Inbound, every decoded packet passes through [`dispatch`]: the router
//! sniffs it first (ack/nak bookkeeping, flood relay), then packets for us
//! or for everyone are handed to the local application. Dispatch never
//! claims a packet exclusively, so other observers still see it.

use super::packet::{AppMessage, Data, MeshPacket, NodeNum, PacketId, Payload, Priority, Routing, RoutingError};
use super::traits::{AppDelivery, Router};
use tracing::trace;

/// Turn a freshly allocated packet into an ack (error `None`) or nak for
/// `request_id`, addressed to `to`.
pub fn ack_nak_packet(
    mut packet: MeshPacket,
    error: RoutingError,
    to: NodeNum,
    request_id: PacketId,
) -> MeshPacket {
    packet.payload = Payload::Decoded(Data {
        message: AppMessage::Routing(Routing {
            error_reason: error,
        }),
        request_id,
        want_response: false,
    });
    packet.priority = Priority::Ack;
    // Immediate neighbors only
    packet.hop_limit = 0;
    packet.want_ack = false;
    packet.to = to;
    packet
}

/// Let the router sniff `packet`, then deliver it to `app` if it is for us
/// or broadcast and did not come from the local app in the first place.
///
/// Returns `false`: the packet is never consumed here.
pub fn dispatch<T, A>(router: &mut T, packet: &MeshPacket, app: &mut A) -> bool
where
    T: Router + ?Sized,
    A: AppDelivery + ?Sized,
{
    trace!(from = %packet.from, to = %packet.to, id = packet.id, "Routing sniffing");
    router.sniff_received(packet, packet.routing());

    let for_us = packet.is_for_node(router.node_num());
    if for_us && !packet.from.is_local() && packet.decoded_data().is_some() {
        trace!(id = packet.id, "Delivering rx packet");
        app.deliver(packet);
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::traits::MeshResult;
    use std::time::Duration;

    struct SniffLog {
        me: NodeNum,
        sniffed: Vec<(PacketId, Option<RoutingError>)>,
    }

    impl Router for SniffLog {
        fn node_num(&self) -> NodeNum {
            self.me
        }

        fn send(&mut self, _packet: MeshPacket) -> MeshResult<()> {
            Ok(())
        }

        fn should_filter_received(&mut self, _packet: &MeshPacket) -> bool {
            false
        }

        fn sniff_received(&mut self, packet: &MeshPacket, routing: Option<&Routing>) {
            self.sniffed.push((packet.id, routing.map(|r| r.error_reason)));
        }

        fn alloc_for_sending(&mut self) -> MeshPacket {
            MeshPacket::default()
        }

        fn retransmission_delay(&self, _packet: &MeshPacket) -> Duration {
            Duration::ZERO
        }
    }

    fn log() -> SniffLog {
        SniffLog {
            me: NodeNum::new(0x10),
            sniffed: Vec::new(),
        }
    }

    #[test]
    fn test_ack_nak_packet_shape() {
        let base = MeshPacket {
            from: NodeNum::new(0x10),
            id: 77,
            hop_limit: 3,
            want_ack: true,
            ..MeshPacket::default()
        };
        let nak = ack_nak_packet(base, RoutingError::MaxRetransmit, NodeNum::new(0x20), 5);

        assert_eq!(nak.to, NodeNum::new(0x20));
        assert_eq!(nak.id, 77);
        assert_eq!(nak.hop_limit, 0);
        assert!(!nak.want_ack);
        assert_eq!(nak.priority, Priority::Ack);
        assert_eq!(nak.request_id(), 5);
        assert_eq!(nak.routing().unwrap().error_reason, RoutingError::MaxRetransmit);
    }

    #[test]
    fn test_dispatch_sniffs_then_delivers() {
        let mut router = log();
        let mut app: Vec<MeshPacket> = Vec::new();

        let ack = ack_nak_packet(
            MeshPacket {
                from: NodeNum::new(0x20),
                id: 3,
                ..MeshPacket::default()
            },
            RoutingError::None,
            NodeNum::new(0x10),
            9,
        );
        assert!(!dispatch(&mut router, &ack, &mut app));
        assert_eq!(router.sniffed, vec![(3, Some(RoutingError::None))]);
        assert_eq!(app.len(), 1);

        let text = MeshPacket::text(NodeNum::new(0x20), NodeNum::BROADCAST, 4, "hi");
        dispatch(&mut router, &text, &mut app);
        assert_eq!(router.sniffed[1], (4, None));
        assert_eq!(app.len(), 2);
    }

    #[test]
    fn test_dispatch_skips_other_destinations_and_local_origin() {
        let mut router = log();
        let mut app: Vec<MeshPacket> = Vec::new();

        let elsewhere = MeshPacket::text(NodeNum::new(0x20), NodeNum::new(0x30), 1, "x");
        dispatch(&mut router, &elsewhere, &mut app);

        let from_phone = MeshPacket::text(NodeNum::LOCAL, NodeNum::BROADCAST, 2, "x");
        dispatch(&mut router, &from_phone, &mut app);

        let opaque = MeshPacket {
            from: NodeNum::new(0x20),
            to: NodeNum::BROADCAST,
            id: 3,
            payload: Payload::Encrypted(vec![1, 2]),
            ..MeshPacket::default()
        };
        dispatch(&mut router, &opaque, &mut app);

        // All three were still sniffed
        assert_eq!(router.sniffed.len(), 3);
        assert!(app.is_empty());
    }
}
