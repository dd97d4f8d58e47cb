// End-to-end checks of the byte-stream -> extractor -> hub path: any
// subscriber, whenever it joins, must receive a decoder-initializable
// sequence (SPS before PPS before IDR, IDR as first VCL unit) with
// order preserved.

use droidcast::stream::{BroadcastHub, H264Unit, UnitExtractor, UnitKind};

/// Deterministic xorshift so chunk splits vary without a test dep.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

fn annexb_unit(nal_type: u8, tag: u8, body_len: usize) -> Vec<u8> {
    let mut unit = vec![0, 0, 0, 1, nal_type & 0x1F, tag];
    unit.extend(std::iter::repeat(0x42).take(body_len));
    unit
}

/// Three GOPs of encoded stream: SPS, PPS, SEI, IDR, then P-frames.
fn synthetic_stream(gops: usize, frames_per_gop: usize) -> Vec<u8> {
    let mut stream = Vec::new();
    let mut tag = 0u8;
    for _ in 0..gops {
        stream.extend(annexb_unit(7, tag, 12));
        stream.extend(annexb_unit(8, tag, 6));
        stream.extend(annexb_unit(6, tag, 8));
        stream.extend(annexb_unit(5, tag, 400));
        for _ in 0..frames_per_gop {
            tag = tag.wrapping_add(1);
            stream.extend(annexb_unit(1, tag, 200));
        }
        tag = tag.wrapping_add(1);
    }
    // Trailing unit so the last real one can close.
    stream.extend(annexb_unit(9, 0xFF, 1));
    stream
}

fn feed_chunked(extractor: &mut UnitExtractor, data: &[u8], rng: &mut Rng) -> Vec<H264Unit> {
    let mut units = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let take = (1 + rng.below(1500)).min(data.len() - pos);
        units.extend(extractor.push(&data[pos..pos + take]));
        pos += take;
    }
    units
}

/// The sequence a subscriber sees must let a decoder start: SPS first,
/// then PPS, and no VCL unit before the first IDR.
fn assert_decoder_initializable(units: &[H264Unit]) {
    assert!(!units.is_empty(), "subscriber received nothing");
    assert_eq!(units[0].kind, UnitKind::Sps, "first unit must be SPS");
    let pps_at = units
        .iter()
        .position(|u| u.kind == UnitKind::Pps)
        .expect("no PPS received");
    let first_vcl = units
        .iter()
        .position(|u| u.kind.is_vcl())
        .expect("no VCL unit received");
    assert!(pps_at < first_vcl, "PPS must precede the first VCL unit");
    assert_eq!(
        units[first_vcl].kind,
        UnitKind::Idr,
        "first VCL unit must be an IDR"
    );
}

fn drain(rx: &mut tokio::sync::mpsc::Receiver<H264Unit>) -> Vec<H264Unit> {
    let mut units = Vec::new();
    while let Ok(unit) = rx.try_recv() {
        units.push(unit);
    }
    units
}

#[tokio::test]
async fn every_join_point_yields_a_decodable_sequence() {
    let stream = synthetic_stream(3, 5);
    let mut rng = Rng(0x00d1_ce5e);

    for trial in 0..8 {
        let mut extractor = UnitExtractor::new();
        // The trailing unit stays open in the extractor; 9 per GOP close.
        let units = feed_chunked(&mut extractor, &stream, &mut rng);
        assert_eq!(units.len(), 3 * 9, "trial {trial}: unit count");

        let hub = BroadcastHub::new(256, 4 * 1024 * 1024);
        // One subscriber joins before anything, one mid-stream at a
        // random unit boundary, one after everything.
        let join_at = 1 + rng.below(units.len() - 1);
        let mut early = hub.subscribe();
        let mut mid = None;
        for (i, unit) in units.iter().enumerate() {
            if i == join_at {
                mid = Some(hub.subscribe());
            }
            hub.publish(unit.clone());
        }
        let mut late = hub.subscribe();

        let early_units = drain(&mut early.rx);
        assert_decoder_initializable(&early_units);

        let mid_units = drain(&mut mid.as_mut().expect("mid subscriber").rx);
        assert_decoder_initializable(&mid_units);

        let late_units = drain(&mut late.rx);
        assert_decoder_initializable(&late_units);
        assert_eq!(late.prefill_len, late_units.len());
    }
}

#[tokio::test]
async fn mid_gop_joiner_replays_the_cached_gop_before_live() {
    let stream = synthetic_stream(2, 4);
    let mut rng = Rng(0xfeed_f00d);
    let mut extractor = UnitExtractor::new();
    let units = feed_chunked(&mut extractor, &stream, &mut rng);

    let hub = BroadcastHub::new(256, 4 * 1024 * 1024);
    // Publish the first GOP head plus two P-frames.
    for unit in &units[..6] {
        hub.publish(unit.clone());
    }
    let mut sub = hub.subscribe();
    assert_eq!(sub.prefill_len, 6);

    // The prefill bytes are exactly the published bytes, in order.
    let received = drain(&mut sub.rx);
    for (got, sent) in received.iter().zip(&units[..6]) {
        assert_eq!(got.bytes, sent.bytes);
    }

    // Live units continue the same sequence.
    hub.publish(units[6].clone());
    let live = drain(&mut sub.rx);
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].bytes, units[6].bytes);
}

#[tokio::test]
async fn avcc_input_feeds_the_hub_identically() {
    // The same NAL payloads, length-prefixed: subscribers still get a
    // decodable Annex-B sequence.
    let annexb = synthetic_stream(1, 3);
    let mut rng = Rng(0x7777_1111);

    let mut reference = UnitExtractor::new();
    let reference_units = feed_chunked(&mut reference, &annexb, &mut rng);

    let mut avcc = Vec::new();
    for unit in &reference_units {
        let payload = &unit.bytes[4..];
        avcc.extend((payload.len() as u32).to_be_bytes());
        avcc.extend_from_slice(payload);
    }

    let mut extractor = UnitExtractor::new();
    let units = feed_chunked(&mut extractor, &avcc, &mut rng);
    // AVCC framing needs no trailing unit to close the last one.
    assert_eq!(units.len(), reference_units.len());

    let hub = BroadcastHub::new(256, 4 * 1024 * 1024);
    for unit in &units {
        hub.publish(unit.clone());
    }
    let mut sub = hub.subscribe();
    let received = drain(&mut sub.rx);
    assert_decoder_initializable(&received);
    for unit in &received {
        assert_eq!(&unit.bytes[..4], &[0, 0, 0, 1]);
    }
}
