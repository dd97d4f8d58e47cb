// GOP cache: the self-sufficient prefix handed to late joiners.
// Holds the latest parameter sets and the unit run from the most recent
// IDR, so a new subscriber can start decoding immediately.

use std::time::{Duration, Instant};

use crate::stream::nal::{H264Unit, UnitKind};

#[derive(Debug)]
pub struct GopCache {
    latest_sps: Option<H264Unit>,
    latest_pps: Option<H264Unit>,
    /// AUD/SEI units observed since the last VCL unit; they lead the
    /// next GOP.
    prefix_before_vcl: Vec<H264Unit>,
    /// `[SPS, PPS, prefix..., IDR, non-IDR...]` or empty.
    current_gop: Vec<H264Unit>,
    gop_size_bytes: usize,
    gop_cap_bytes: usize,
    /// Set when the cap discarded the GOP; cleared by the next IDR.
    awaiting_idr: bool,
    /// When `current_gop` last became (or started) empty.
    empty_since: Option<Instant>,
    last_idr_at: Option<Instant>,
}

impl GopCache {
    pub fn new(gop_cap_bytes: usize) -> Self {
        Self {
            latest_sps: None,
            latest_pps: None,
            prefix_before_vcl: Vec::new(),
            current_gop: Vec::new(),
            gop_size_bytes: 0,
            gop_cap_bytes,
            awaiting_idr: false,
            empty_since: Some(Instant::now()),
            last_idr_at: None,
        }
    }

    pub fn update(&mut self, unit: &H264Unit) {
        match unit.kind {
            UnitKind::Sps => {
                // A changed SPS invalidates the cached GOP; the next IDR
                // reseeds it against the new parameter set.
                if let Some(first) = self.current_gop.first() {
                    if first.bytes != unit.bytes {
                        self.discard_gop(false);
                    }
                }
                self.latest_sps = Some(unit.clone());
                self.prefix_before_vcl.clear();
            }
            UnitKind::Pps => {
                self.latest_pps = Some(unit.clone());
            }
            UnitKind::Aud | UnitKind::Sei => {
                self.prefix_before_vcl.push(unit.clone());
            }
            UnitKind::Idr => {
                let (Some(sps), Some(pps)) = (&self.latest_sps, &self.latest_pps) else {
                    // No parameter sets: a GOP seeded here could not
                    // initialize a decoder. Drop the IDR from the cache.
                    self.prefix_before_vcl.clear();
                    return;
                };
                let mut gop = Vec::with_capacity(3 + self.prefix_before_vcl.len());
                gop.push(sps.clone());
                gop.push(pps.clone());
                gop.append(&mut self.prefix_before_vcl);
                gop.push(unit.clone());
                self.gop_size_bytes = gop.iter().map(H264Unit::len).sum();
                self.current_gop = gop;
                self.awaiting_idr = false;
                self.empty_since = None;
                self.last_idr_at = Some(unit.generated_at);
                self.enforce_cap();
            }
            UnitKind::NonIdr => {
                self.prefix_before_vcl.clear();
                if !self.current_gop.is_empty() {
                    self.gop_size_bytes += unit.len();
                    self.current_gop.push(unit.clone());
                    self.enforce_cap();
                }
            }
            UnitKind::Other => {}
        }
    }

    fn enforce_cap(&mut self) {
        if self.gop_size_bytes > self.gop_cap_bytes {
            self.discard_gop(true);
        }
    }

    fn discard_gop(&mut self, awaiting_idr: bool) {
        if !self.current_gop.is_empty() {
            self.current_gop.clear();
            self.empty_since = Some(Instant::now());
        }
        self.gop_size_bytes = 0;
        self.awaiting_idr = awaiting_idr;
    }

    /// Read-only view of the cached GOP; empty while awaiting an IDR.
    pub fn snapshot_prefill(&self) -> Vec<H264Unit> {
        self.current_gop.clone()
    }

    /// Drop all cached state (config change, encoder restart).
    pub fn reset(&mut self) {
        self.latest_sps = None;
        self.latest_pps = None;
        self.prefix_before_vcl.clear();
        self.discard_gop(false);
    }

    /// How long the cache has been continuously empty, if it is.
    pub fn empty_for(&self) -> Option<Duration> {
        self.empty_since.map(|t| t.elapsed())
    }

    pub fn is_empty(&self) -> bool {
        self.current_gop.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.gop_size_bytes
    }

    pub fn awaiting_idr(&self) -> bool {
        self.awaiting_idr
    }

    pub fn last_idr_at(&self) -> Option<Instant> {
        self.last_idr_at
    }
}
