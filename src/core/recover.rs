//! Recovery scanner
//!
//! Walks every gap of the space table one byte at a time looking for the
//! images of lost slots. A candidate must carry a supported compression
//! tag and name a lost slot in range; CKD tracks stored uncompressed must
//! also repeat their cylinder and head in record 0.
//!
//! The length of a candidate is settled in this order:
//!
//! 1. compressed: the stream is self-delimiting, so decode it and accept
//!    if the expanded image is well formed
//! 2. uncompressed: take the distance to the next plausible header (or
//!    the end of the gap) within one track size
//! 3. otherwise the largest length that still forms a valid image
//!
//! FBA gets a second, weaker pass over whatever pass one left unconsumed:
//! an uncompressed block-group with enough bytes behind it is accepted
//! without a following header to corroborate it.
//!
//! Orphans (slots that had no image to begin with) are only reinstated
//! from images that prove their own extent: compressed streams and CKD
//! tracks. A raw FBA block-group is 61 445 arbitrary bytes and stale
//! free space would match it far too easily.

use crate::compression::{stream_extent, tag_supported, CompressionMethod};
use crate::error::Result;
use crate::geometry::{FBA_GROUP_SIZE, IMAGE_HEADER_SIZE};
use crate::header::DeviceClass;
use crate::io::{ImageFile, ImageIo};
use crate::space::Gap;
use crate::track::{assemble, ckd_r0_matches, DeviceLimits, CKD_MIN_EXPANDED};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Bytes read from a gap at a time
const WINDOW: usize = 1 << 20;

/// An image rediscovered in free space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Found {
    pub slot: u64,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// Compressed images, or uncompressed ones with a boundary behind them
    Corroborated,
    /// Uncompressed FBA block-groups on length alone
    Weak,
}

/// Sliding read buffer over one gap
struct GapReader {
    gap: Gap,
    base: u64,
    buf: Vec<u8>,
}

impl GapReader {
    fn new(gap: Gap) -> Self {
        GapReader {
            gap,
            base: gap.offset,
            buf: Vec::new(),
        }
    }

    /// Up to `want` bytes starting at `at`, clipped to the gap
    fn slice<F: ImageIo>(&mut self, io: &mut ImageFile<F>, at: u64, want: usize) -> Result<&[u8]> {
        let end = at.saturating_add(want as u64).min(self.gap.end());
        if at < self.base || end > self.base + self.buf.len() as u64 {
            let len = (self.gap.end() - at).min(WINDOW.max(want) as u64);
            self.buf = io.read_at(at, len as usize)?;
            self.base = at;
        }
        let from = (at - self.base) as usize;
        let to = (end - self.base) as usize;
        Ok(&self.buf[from..to])
    }
}

struct Scanner<'a> {
    limits: &'a DeviceLimits,
    lost: &'a mut BTreeSet<u64>,
    orphans: &'a BTreeSet<u64>,
}

impl Scanner<'_> {
    /// Tag and slot look right, and record 0 agrees for raw CKD tracks
    fn plausible(&self, s: &[u8]) -> bool {
        if s.len() < IMAGE_HEADER_SIZE || !tag_supported(s[0]) {
            return false;
        }
        let lost = self
            .limits
            .index_of(s)
            .map_or(false, |slot| self.lost.contains(&slot));
        lost && (self.limits.class != DeviceClass::Ckd || s[0] != 0 || ckd_r0_matches(s))
    }

    /// Slot and stored length of an image at the front of `s`
    ///
    /// `left` is the number of bytes from the front of `s` to the end of
    /// the gap; `s` itself may be shorter.
    fn try_at(&self, s: &[u8], left: u64, pass: Pass) -> Option<(u64, usize)> {
        if !self.plausible(s) {
            return None;
        }
        let slot = self.limits.index_of(s)?;
        let method = CompressionMethod::from_u8(s[0])?;

        if method != CompressionMethod::None {
            if pass == Pass::Weak {
                return None;
            }
            let (consumed, body) =
                stream_extent(&s[IMAGE_HEADER_SIZE..], method, self.limits.max_body())?;
            let len = IMAGE_HEADER_SIZE + consumed;
            let expanded = assemble(&s[1..IMAGE_HEADER_SIZE], &body);
            return (len <= self.limits.max_image && self.limits.is_valid_expanded(&expanded))
                .then_some((slot, len));
        }

        match self.limits.class {
            DeviceClass::Fba => {
                let len = FBA_GROUP_SIZE;
                if left < len as u64 || self.orphans.contains(&slot) {
                    return None;
                }
                let accepted = match pass {
                    Pass::Weak => true,
                    Pass::Corroborated => {
                        left == len as u64 || s.get(len..).map_or(false, |next| self.plausible(next))
                    }
                };
                accepted.then_some((slot, len))
            }
            DeviceClass::Ckd => {
                if pass == Pass::Weak {
                    return None;
                }
                let top = s.len().min(self.limits.max_image);
                let boundary = (CKD_MIN_EXPANDED..=top)
                    .find(|&q| q < s.len() && self.plausible(&s[q..]))
                    .or_else(|| (left as usize <= top).then_some(left as usize));
                if let Some(len) = boundary {
                    if self.limits.is_valid_expanded(&s[..len]) {
                        return Some((slot, len));
                    }
                }
                (CKD_MIN_EXPANDED..=top)
                    .rev()
                    .find(|&len| self.limits.is_valid_expanded(&s[..len]))
                    .map(|len| (slot, len))
            }
        }
    }

    fn scan_gap<F: ImageIo>(
        &mut self,
        io: &mut ImageFile<F>,
        gap: Gap,
        pass: Pass,
        found: &mut Vec<Found>,
    ) -> Result<()> {
        let want = self.limits.max_image + CKD_MIN_EXPANDED;
        let mut reader = GapReader::new(gap);
        let mut pos = gap.offset;

        while pos + self.limits.min_image() as u64 <= gap.end() && !self.lost.is_empty() {
            let s = reader.slice(io, pos, want)?;
            match self.try_at(s, gap.end() - pos, pass) {
                Some((slot, len)) => {
                    info!("recovered slot {} at {} ({} bytes)", slot, pos, len);
                    self.lost.remove(&slot);
                    found.push(Found {
                        slot,
                        offset: pos,
                        len: len as u64,
                    });
                    pos += len as u64;
                }
                None => pos += 1,
            }
        }
        Ok(())
    }
}

/// Parts of `gaps` not covered by `found`
fn remaining(gaps: &[Gap], found: &[Found]) -> Vec<Gap> {
    let mut rest = Vec::new();
    for gap in gaps {
        let mut pos = gap.offset;
        let mut inside: Vec<&Found> = found
            .iter()
            .filter(|f| f.offset >= gap.offset && f.offset < gap.end())
            .collect();
        inside.sort_by_key(|f| f.offset);
        for f in inside {
            if f.offset > pos {
                rest.push(Gap {
                    offset: pos,
                    len: f.offset - pos,
                });
            }
            pos = pos.max(f.offset + f.len);
        }
        if gap.end() > pos {
            rest.push(Gap {
                offset: pos,
                len: gap.end() - pos,
            });
        }
    }
    rest
}

/// Search `gaps` for the images of every slot in `lost`
///
/// Found slots are removed from `lost`; whatever is left could not be
/// recovered. Slots also in `orphans` are held to the stricter rules.
pub(crate) fn scan<F: ImageIo>(
    io: &mut ImageFile<F>,
    limits: &DeviceLimits,
    gaps: &[Gap],
    lost: &mut BTreeSet<u64>,
    orphans: &BTreeSet<u64>,
) -> Result<Vec<Found>> {
    let searching = lost.len();
    let mut found = Vec::new();
    let mut scanner = Scanner {
        limits,
        lost,
        orphans,
    };

    for gap in gaps {
        scanner.scan_gap(io, *gap, Pass::Corroborated, &mut found)?;
    }
    if limits.class == DeviceClass::Fba && !scanner.lost.is_empty() {
        for gap in remaining(gaps, &found) {
            scanner.scan_gap(io, gap, Pass::Weak, &mut found)?;
        }
    }
    found.sort_by_key(|f| f.offset);

    debug!(
        "recovery scan: {} of {} slots found in {} gaps",
        found.len(),
        searching,
        gaps.len()
    );
    let missing = lost.difference(orphans).count();
    if missing > 0 {
        warn!("{} slots were not found in free space", missing);
    }
    Ok(found)
}
