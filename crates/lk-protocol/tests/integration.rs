//! Integration tests for the lk-protocol crate.
//!
//! These exercise the publisher → wire → subscriber path across module
//! boundaries: stamping a sample, packetizing it with a codec payloader,
//! shuffling/dropping packets and rebuilding samples on the far side.
//!
//! A sample builder only releases a sample once the first packet of the next
//! one has arrived, so every stream here is followed by one extra sample.

use bytes::Bytes;

use lk_protocol::auth::{AccessToken, TokenVerifier, VideoGrants};
use lk_protocol::packets::{samples, Codec, RtpPacket};
use lk_protocol::payload::{monotonic_ns, read_timestamp, stamp};
use lk_protocol::DEFAULT_MTU;

/// Frame whose first byte is `first`, filled with `fill`, stamped with `ns`.
fn stamped_frame(len: usize, first: u8, fill: u8, ns: u64) -> Bytes {
    let mut buf = vec![fill; len];
    buf[0] = first;
    stamp(&mut buf, ns).expect("frame long enough for trailer");
    Bytes::from(buf)
}

fn packetize(codec: Codec, mtu: usize, frames: &[Bytes]) -> Vec<RtpPacket> {
    let mut packetizer = codec.packetizer(1111, mtu);
    let ticks = samples(std::time::Duration::from_millis(33), codec.clock_rate());
    frames
        .iter()
        .flat_map(|frame| packetizer.packetize(frame, ticks).expect("packetize"))
        .collect()
}

// ---------------------------------------------------------------------------
// 1. Timestamp survives packetization and reassembly
// ---------------------------------------------------------------------------

#[test]
fn send_time_roundtrip_vp8() {
    let sent_at = 123_456_789_012_345u64;
    let frames = [stamped_frame(5_000, 0x10, 0x42, sent_at), stamped_frame(100, 0x10, 0, 0)];
    let packets = packetize(Codec::Vp8, DEFAULT_MTU, &frames);
    assert_eq!(packets.len(), 5 + 1);

    let mut builder = Codec::Vp8.sample_builder();
    for packet in packets {
        builder.push(packet);
    }
    let rebuilt = builder.pop().expect("complete sample");
    assert_eq!(rebuilt.data, frames[0]);
    assert_eq!(read_timestamp(&rebuilt.data), Some(sent_at));
    assert_eq!(rebuilt.prev_dropped_packets, 0);
    // The trailing sample waits for a successor.
    assert!(builder.pop().is_none());
}

#[test]
fn send_time_roundtrip_h264() {
    let sent_at = 0x0000_0001_0000_0001u64;
    let frames = [stamped_frame(5_000, 0x65, 0x42, sent_at), stamped_frame(100, 0x41, 0x42, 0)];
    let packets = packetize(Codec::H264, DEFAULT_MTU, &frames);

    let mut builder = Codec::H264.sample_builder();
    for packet in packets {
        builder.push(packet);
    }
    let rebuilt = builder.pop().expect("complete sample");
    // Annex B start code in front of the NAL unit
    assert_eq!(&rebuilt.data[..4], &[0, 0, 0, 1]);
    assert_eq!(&rebuilt.data[4..], &frames[0][..]);
    assert_eq!(read_timestamp(&rebuilt.data), Some(sent_at));
}

#[test]
fn live_clock_latency_is_small_and_positive() {
    let frames = [stamped_frame(64, 0, 0, monotonic_ns()), stamped_frame(64, 0, 0, monotonic_ns())];
    let mut builder = Codec::Opus.sample_builder();
    for packet in packetize(Codec::Opus, DEFAULT_MTU, &frames) {
        builder.push(packet);
    }
    let rebuilt = builder.pop().unwrap();
    let sent = read_timestamp(&rebuilt.data).unwrap();
    let now = monotonic_ns();
    assert!(now >= sent);
    assert!(now - sent < 100_000_000);
}

// ---------------------------------------------------------------------------
// 2. Reordering within the window is invisible to the consumer
// ---------------------------------------------------------------------------

#[test]
fn reordered_stream_is_rebuilt_in_order() {
    let frames: Vec<Bytes> = (0..20u8).map(|i| stamped_frame(250, i, i, u64::from(i))).collect();
    let mut packets = packetize(Codec::Vp8, 112, &frames);
    assert_eq!(packets.len(), 60);

    // Swap neighbours pairwise, leaving the very first packet in place.
    for i in (1..packets.len() - 1).step_by(2) {
        packets.swap(i, i + 1);
    }

    let mut builder = Codec::Vp8.sample_builder();
    let mut rebuilt = Vec::new();
    for packet in packets {
        builder.push(packet);
        while let Some(sample) = builder.pop() {
            rebuilt.push(sample);
        }
    }

    assert_eq!(rebuilt.len(), 19);
    for (i, sample) in rebuilt.iter().enumerate() {
        assert_eq!(sample.data[0], i as u8);
        assert_eq!(read_timestamp(&sample.data), Some(i as u64));
        assert_eq!(sample.prev_dropped_packets, 0);
    }
}

// ---------------------------------------------------------------------------
// 3. Loss is accounted for, never silently swallowed
// ---------------------------------------------------------------------------

#[test]
fn lost_packets_are_counted_and_stream_recovers() {
    let frames: Vec<Bytes> = (0..50u8).map(|i| stamped_frame(250, i, i, u64::from(i))).collect();
    let packets = packetize(Codec::Vp8, 112, &frames);

    let mut builder = Codec::Vp8.sample_builder();
    let mut delivered = Vec::new();
    let mut dropped = 0u64;
    for (i, packet) in packets.into_iter().enumerate() {
        // Lose every 17th packet early on; the tail stays clean.
        if i < 60 && i % 17 == 5 {
            continue;
        }
        builder.push(packet);
        while let Some(sample) = builder.pop() {
            dropped += u64::from(sample.prev_dropped_packets);
            delivered.push(sample);
        }
    }

    assert!(dropped > 0);
    assert!(delivered.len() < 49);
    // Whatever was delivered is a whole frame.
    for sample in &delivered {
        assert_eq!(sample.data.len(), 250);
        assert_eq!(read_timestamp(&sample.data), Some(u64::from(sample.data[0])));
    }
    let indices: Vec<u8> = delivered.iter().map(|s| s.data[0]).collect();
    assert!((30..49).all(|i| indices.contains(&i)), "{indices:?}");
}

#[test]
fn orphan_tail_is_dropped() {
    let frames: Vec<Bytes> = (0..3u8).map(|i| stamped_frame(250, i, i, 0)).collect();
    let packets = packetize(Codec::Vp8, 112, &frames);

    let mut builder = Codec::Vp8.sample_builder();
    let mut delivered = Vec::new();
    // Join mid-sample: the head of sample 0 never arrives.
    for packet in packets.into_iter().skip(1) {
        builder.push(packet);
        while let Some(sample) = builder.pop() {
            delivered.push(sample);
        }
    }
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].data[0], 1);
    assert!(delivered[0].prev_dropped_packets > 0);
}

// ---------------------------------------------------------------------------
// 4. Tokens
// ---------------------------------------------------------------------------

#[test]
fn token_carries_room_grant() {
    let token = AccessToken::new("devkey", "devsecret-devsecret-devsecret-00")
        .with_identity("abcde_3")
        .with_grants(VideoGrants::join("testroom123"))
        .to_jwt()
        .unwrap();
    let claims = TokenVerifier::new("devkey", "devsecret-devsecret-devsecret-00")
        .verify(&token)
        .unwrap();
    assert_eq!(claims.video.room, "testroom123");
    assert!(claims.video.can_subscribe);
}
