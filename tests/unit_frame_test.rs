use helmsman::core::messaging::{ControlMessage, EndpointId, HostSpec, MsgClass, WireFrame};

fn sender() -> EndpointId {
    EndpointId {
        node_id: 1,
        pid: 4242,
        uname: "alpha".to_string(),
    }
}

#[test]
fn test_frame_round_trip_uncompressed() {
    let message = ControlMessage::Ping {
        from: "alpha".to_string(),
    };
    let frame = WireFrame::build(sender(), HostSpec::broadcast(), 7, &message, 64 * 1024).unwrap();
    assert!(!frame.header.is_compressed);
    assert_eq!(frame.header.seq, 7);
    assert_eq!(frame.header.class, MsgClass::Controller);

    let bytes = frame.encode().unwrap();
    let decoded = WireFrame::decode(&bytes).unwrap();
    assert_eq!(decoded, frame);
    assert_eq!(decoded.message().unwrap(), message);
}

#[test]
fn test_large_payload_is_compressed() {
    // Repetitive content compresses well past any threshold.
    let message = ControlMessage::TeAbort {
        reason: "x".repeat(8192),
        priority: 1,
    };
    let frame = WireFrame::build(sender(), HostSpec::broadcast(), 1, &message, 1024).unwrap();
    assert!(frame.header.is_compressed);
    assert!((frame.header.compressed_size as usize) < frame.header.size as usize);
    assert_eq!(frame.message().unwrap(), message);
}

#[test]
fn test_small_payload_skips_compression() {
    let message = ControlMessage::Ping {
        from: "a".to_string(),
    };
    let frame = WireFrame::build(sender(), HostSpec::broadcast(), 1, &message, 1024).unwrap();
    assert!(!frame.header.is_compressed);
    assert_eq!(frame.header.compressed_size, 0);
}

#[test]
fn test_round_trip_survives_a_tiny_threshold() {
    // Whatever the compressor decides, decode must recover the message.
    let blob: String = (0..4096u32).map(|i| char::from(33 + (i * 7 % 90) as u8)).collect();
    let message = ControlMessage::TeAbort {
        reason: blob,
        priority: 0,
    };
    let frame = WireFrame::build(sender(), HostSpec::broadcast(), 1, &message, 10).unwrap();
    assert_eq!(frame.message().unwrap(), message);
}

#[test]
fn test_fencing_messages_use_the_fencing_class() {
    let message = ControlMessage::FenceRequest {
        target: "beta".to_string(),
        action: "reboot".to_string(),
        origin: "alpha".to_string(),
        client_id: "c1".to_string(),
        call_id: 1,
        timeout_ms: 1000,
        user_data: None,
    };
    let frame = WireFrame::build(sender(), HostSpec::broadcast(), 1, &message, 64 * 1024).unwrap();
    assert_eq!(frame.header.class, MsgClass::Fencing);
}

#[test]
fn test_unicast_host_spec() {
    let spec = HostSpec::to_uname("beta");
    assert_eq!(spec.uname.as_deref(), Some("beta"));
    assert!(spec.node_id.is_none());
    assert!(!spec.local);
}

#[test]
fn test_decode_rejects_trailing_garbage() {
    let message = ControlMessage::Ping {
        from: "alpha".to_string(),
    };
    let frame = WireFrame::build(sender(), HostSpec::broadcast(), 1, &message, 64 * 1024).unwrap();
    let mut bytes = frame.encode().unwrap().to_vec();
    bytes.extend_from_slice(b"junk");
    assert!(WireFrame::decode(&bytes).is_err());
}

#[test]
fn test_decode_rejects_truncation() {
    let message = ControlMessage::Ping {
        from: "alpha".to_string(),
    };
    let frame = WireFrame::build(sender(), HostSpec::broadcast(), 1, &message, 64 * 1024).unwrap();
    let bytes = frame.encode().unwrap();
    assert!(WireFrame::decode(&bytes[..bytes.len() - 2]).is_err());
}
