//! Property-based tests for the suffix-tag wire format.
//!
//! Verifies decode(encode(v)) = v for the scalar codec, the varint across
//! every width boundary, short names, and the protocol messages, plus the
//! little-endian byte-order contract.

use proptest::prelude::*;

use quicr_transport::packet::Packet;
use quicr_transport::wire::*;
use quicr_transport::ShortName;

fn scratch() -> Packet {
    Packet::with_header(Magic::Data, 0)
}

// ─── Varint ─────────────────────────────────────────────────────────────────

/// Values spanning all four encoding widths.
fn varint_value() -> impl Strategy<Value = u64> {
    prop_oneof![
        0u64..(1 << 7),
        (1u64 << 7)..(1 << 14),
        (1u64 << 14)..(1 << 29),
        (1u64 << 29)..=UintVar::MAX,
    ]
}

/// The exact boundary values either side of each width change.
fn varint_boundary() -> impl Strategy<Value = u64> {
    prop_oneof![
        Just(0u64),
        Just((1u64 << 7) - 1),
        Just(1u64 << 7),
        Just((1u64 << 14) - 1),
        Just(1u64 << 14),
        Just((1u64 << 29) - 1),
        Just(1u64 << 29),
        Just(UintVar::MAX),
    ]
}

fn short_name() -> impl Strategy<Value = ShortName> {
    (
        any::<u64>(),
        any::<u32>(),
        any::<u8>(),
        any::<u32>(),
        any::<u8>(),
    )
        .prop_map(
            |(resource_id, sender_id, source_id, media_time, fragment_id)| ShortName {
                resource_id,
                sender_id,
                source_id,
                media_time,
                fragment_id,
            },
        )
}

proptest! {
    #[test]
    fn varint_roundtrip(val in varint_value()) {
        let v = UintVar::from_u64(val);
        let mut p = scratch();
        p.push_var(v);
        prop_assert_eq!(p.data_len(), v.encoded_len());
        prop_assert_eq!(p.pop_var().map(UintVar::value), Some(val));
        prop_assert_eq!(p.data_len(), 0);
    }

    #[test]
    fn varint_boundary_roundtrip(val in varint_boundary()) {
        let mut p = scratch();
        p.push_var(UintVar::from_u64(val));
        prop_assert_eq!(p.pop_var().map(UintVar::value), Some(val));
    }

    #[test]
    fn varint_width_is_minimal(val in varint_value()) {
        let expected = if val < (1 << 7) { 1 }
            else if val < (1 << 14) { 2 }
            else if val < (1 << 29) { 4 }
            else { 8 };
        prop_assert_eq!(UintVar::from_u64(val).encoded_len(), expected);
    }

    #[test]
    fn varint_rejects_above_max(val in (UintVar::MAX + 1)..=u64::MAX) {
        prop_assert!(UintVar::new(val).is_none());
    }

    #[test]
    fn varint_stacked_roundtrip(a in varint_value(), b in varint_value(), c in varint_value()) {
        let mut p = scratch();
        p.push_var(UintVar::from_u64(a));
        p.push_var(UintVar::from_u64(b));
        p.push_var(UintVar::from_u64(c));

        prop_assert_eq!(p.pop_var().map(UintVar::value), Some(c));
        prop_assert_eq!(p.pop_var().map(UintVar::value), Some(b));
        prop_assert_eq!(p.pop_var().map(UintVar::value), Some(a));
    }

    // ─── Scalars ────────────────────────────────────────────────────────

    #[test]
    fn scalar_stack_roundtrip(a in any::<u8>(), b in any::<u16>(), c in any::<u32>(), d in any::<u64>()) {
        let mut p = scratch();
        p.push_u8(a);
        p.push_u16(b);
        p.push_u32(c);
        p.push_u64(d);

        prop_assert_eq!(p.pop_u64(), Some(d));
        prop_assert_eq!(p.pop_u32(), Some(c));
        prop_assert_eq!(p.pop_u16(), Some(b));
        prop_assert_eq!(p.pop_u8(), Some(a));
    }

    #[test]
    fn u32_wire_bytes_are_little_endian(val in any::<u32>()) {
        let mut p = Packet::new();
        p.push_u32(val);
        let expected = val.to_le_bytes();
        prop_assert_eq!(p.as_bytes(), expected.as_slice());
    }

    #[test]
    fn string_roundtrip(s in "[ -~]{0,255}") {
        let mut p = scratch();
        prop_assume!(p.push_str(&s));
        prop_assert_eq!(p.pop_str(), Some(s));
    }

    #[test]
    fn byte_vec_roundtrip(v in proptest::collection::vec(any::<u8>(), 0..=255)) {
        let mut p = scratch();
        prop_assert!(p.push_vec(&v));
        prop_assert_eq!(p.pop_vec(), Some(v));
    }

    // ─── Short names ────────────────────────────────────────────────────

    #[test]
    fn short_name_roundtrip(name in short_name()) {
        let mut p = scratch();
        p.push_name(&name);
        prop_assert_eq!(p.pop_name(), Some(name));
    }

    // ─── Protocol messages ──────────────────────────────────────────────

    #[test]
    fn sync_req_roundtrip(
        cookie in any::<u64>(),
        origin in "[a-z0-9.]{0,64}",
        sender_id in any::<u32>(),
        client_time_ms in any::<u64>(),
        features in varint_value(),
    ) {
        let msg = NetSyncReq {
            cookie,
            origin,
            sender_id,
            client_time_ms,
            supported_features: features,
        };
        let mut p = scratch();
        msg.encode(&mut p);
        prop_assert_eq!(NetSyncReq::decode(&mut p), Some(msg));
    }

    #[test]
    fn sync_ack_roundtrip(server_time_ms in any::<u64>(), features in varint_value()) {
        let msg = NetSyncAck { server_time_ms, use_features: features };
        let mut p = scratch();
        msg.encode(&mut p);
        prop_assert_eq!(NetSyncAck::decode(&mut p), Some(msg));
    }

    #[test]
    fn rst_retry_roundtrip(cookie in any::<u64>()) {
        let msg = NetRstRetry { cookie };
        let mut p = scratch();
        msg.encode(&mut p);
        prop_assert_eq!(NetRstRetry::decode(&mut p), Some(msg));
    }

    #[test]
    fn rst_redirect_roundtrip(cookie in any::<u64>(), origin in "[a-z0-9.]{0,64}", port in any::<u16>()) {
        let msg = NetRstRedirect { cookie, origin, port };
        let mut p = scratch();
        msg.encode(&mut p);
        prop_assert_eq!(NetRstRedirect::decode(&mut p), Some(msg));
    }

    #[test]
    fn ack_roundtrip(
        recv_time_us in any::<u32>(),
        client_seq_num in any::<u32>(),
        ack_vec in any::<u64>(),
        ecn_vec in any::<u8>(),
    ) {
        let msg = NetAck { recv_time_us, client_seq_num, ack_vec, ecn_vec };
        let mut p = scratch();
        msg.encode(&mut p);
        prop_assert_eq!(NetAck::decode(&mut p), Some(msg));
    }

    #[test]
    fn nack_roundtrip(relay_seq_num in any::<u32>()) {
        let msg = NetNack { relay_seq_num };
        let mut p = scratch();
        msg.encode(&mut p);
        prop_assert_eq!(NetNack::decode(&mut p), Some(msg));
    }

    #[test]
    fn client_data_roundtrip(client_seq_num in any::<u32>()) {
        let msg = ClientData { client_seq_num };
        let mut p = scratch();
        msg.encode(&mut p);
        prop_assert_eq!(ClientData::decode(&mut p), Some(msg));
    }

    #[test]
    fn relay_data_roundtrip(relay_seq_num in any::<u32>(), remote_send_time_us in any::<u32>()) {
        let msg = RelayData { relay_seq_num, remote_send_time_us };
        let mut p = scratch();
        msg.encode(&mut p);
        prop_assert_eq!(RelayData::decode(&mut p), Some(msg));
    }

    #[test]
    fn rate_req_roundtrip(bitrate_kbps in any::<u32>()) {
        let msg = NetRateReq { bitrate_kbps };
        let mut p = scratch();
        msg.encode(&mut p);
        prop_assert_eq!(NetRateReq::decode(&mut p), Some(msg));
    }

    #[test]
    fn subscribe_req_roundtrip(name in short_name()) {
        let msg = SubscribeReq { name };
        let mut p = scratch();
        msg.encode(&mut p);
        prop_assert_eq!(SubscribeReq::decode(&mut p), Some(msg));
    }

    #[test]
    fn pub_data_roundtrip_over_payload(
        name in short_name(),
        payload in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let mut p = scratch();
        p.push_slice(&payload);
        let msg = PubData { name, payload_len: payload.len() as u16 };
        msg.encode(&mut p);

        // Non-destructive peek agrees with the destructive decode.
        prop_assert_eq!(PubData::peek(&p), Some(msg));
        prop_assert_eq!(PubData::decode(&mut p), Some(msg));
        prop_assert_eq!(p.data_len(), payload.len());
    }

    // ─── Adversarial input ──────────────────────────────────────────────

    #[test]
    fn random_bytes_never_panic_the_parser(data in proptest::collection::vec(any::<u8>(), 0..128)) {
        let src = "127.0.0.1:1".parse().unwrap();
        let mut p = Packet::from_datagram(data, src);
        // Walk the tail like a receiver would; all decode paths must fail
        // soft on garbage.
        let _ = PubData::peek(&p);
        match p.next_tag() {
            PacketTag::Sync => { let _ = NetSyncReq::decode(&mut p); }
            PacketTag::Ack => { let _ = NetAck::decode(&mut p); }
            PacketTag::ClientData => { let _ = ClientData::decode(&mut p); }
            PacketTag::RelayData => { let _ = RelayData::decode(&mut p); }
            PacketTag::SubscribeReq => { let _ = SubscribeReq::decode(&mut p); }
            PacketTag::PubData => { let _ = PubData::decode(&mut p); }
            _ => {}
        }
        let _ = p.pop_var();
    }
}
