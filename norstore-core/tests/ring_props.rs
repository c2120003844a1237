//! Property tests for the frame ring buffer.

use norstore_core::ring::FlashRingBuffer;
use norstore_core::FlashRegion;
use norstore_sim::{SimFlash, SECTOR_SIZE};
use proptest::prelude::*;

const SECTORS: usize = 16;

fn fresh_ring() -> FlashRingBuffer<SimFlash> {
    FlashRingBuffer::new(
        SimFlash::new(SECTORS),
        FlashRegion::new(0, (SECTORS * SECTOR_SIZE) as u32),
        false,
    )
    .unwrap()
}

fn collect(ring: &mut FlashRingBuffer<SimFlash>) -> Vec<(u32, Vec<u8>)> {
    let mut out = Vec::new();
    let mut info = match ring.first_frame_info() {
        Ok(info) => info,
        Err(_) => return out,
    };
    loop {
        let mut buf = vec![0u8; info.length as usize];
        ring.read_payload(&info, 0, &mut buf).unwrap();
        out.push((info.index, buf));
        match ring.next_frame_info(&info) {
            Ok(next) => info = next,
            Err(_) => return out,
        }
    }
}

fn payloads() -> impl Strategy<Value = Vec<Vec<u8>>> {
    // Total stays well under the 16-sector capacity, so nothing is
    // reclaimed and every frame must read back.
    prop::collection::vec(prop::collection::vec(any::<u8>(), 1..1500), 1..24)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_written_frames_read_back(payloads in payloads()) {
        let mut ring = fresh_ring();
        for p in &payloads {
            ring.write_payload(p, true).unwrap();
        }
        let frames = collect(&mut ring);
        prop_assert_eq!(frames.len(), payloads.len());
        for (i, (index, data)) in frames.iter().enumerate() {
            prop_assert_eq!(*index as usize, i);
            prop_assert_eq!(data, &payloads[i]);
        }
    }

    #[test]
    fn prop_recovery_reconstructs_cursors(
        payloads in payloads(),
        read_upto in 0usize..24,
    ) {
        let mut ring = fresh_ring();
        for p in &payloads {
            ring.write_payload(p, true).unwrap();
        }
        let read_upto = read_upto.min(payloads.len());
        if read_upto > 0 {
            let mut info = ring.first_frame_info().unwrap();
            for _ in 0..read_upto - 1 {
                info = ring.next_frame_info(&info).unwrap();
            }
            // Mark everything through `info` as read.
            let end = info.start_pos + 1;
            ring.mark_read_before(end).unwrap();
        }
        let before = collect(&mut ring);
        let unread_before = ring.first_unread_frame_info().ok().map(|i| i.index);

        let region = ring.region();
        let mut ring =
            FlashRingBuffer::new(ring.into_flash(), region, true).unwrap();
        prop_assert_eq!(collect(&mut ring), before);
        let unread_after = ring.first_unread_frame_info().ok().map(|i| i.index);
        prop_assert_eq!(unread_after, unread_before);
    }

    #[test]
    fn prop_partial_reads_match(payload in prop::collection::vec(any::<u8>(), 1..4000), offset in 0u32..4000) {
        let mut ring = fresh_ring();
        ring.write_payload(&payload, true).unwrap();
        let info = ring.first_frame_info().unwrap();

        let offset = offset.min(payload.len() as u32);
        let mut buf = vec![0u8; 256];
        let n = ring.read_payload(&info, offset, &mut buf).unwrap();
        let expect = &payload[offset as usize..(offset as usize + 256).min(payload.len())];
        prop_assert_eq!(&buf[..n], expect);
    }
}
