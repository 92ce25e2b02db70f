//! Track and block-group image structure
//!
//! Stored image: `[tag][4 header bytes][body]` where the body may be
//! compressed. Expanded image: the same header with the tag byte zeroed,
//! followed by the raw body.
//!
//! ```text
//! CKD body: R0 count (cc hh 00 00 0008) | 8 data bytes | count/key/data ... | FF*8
//! FBA body: 120 blocks of 512 bytes
//! ```

use crate::compression::{self, CompressionMethod};
use crate::error::{CckdError, Result};
use crate::geometry::{
    Geometry, CKD_COUNT_SIZE, CKD_R0_DATA_LEN, FBA_GROUP_SIZE, IMAGE_HEADER_SIZE,
};
use crate::header::DeviceClass;

/// End-of-track marker
pub const EOT_MARKER: [u8; 8] = [0xFF; 8];

/// Smallest expanded CKD track: header, record 0 and the end marker
pub const CKD_MIN_EXPANDED: usize =
    IMAGE_HEADER_SIZE + CKD_COUNT_SIZE + CKD_R0_DATA_LEN + EOT_MARKER.len();

/// Per-device bounds every image is checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub class: DeviceClass,
    /// Heads per cylinder (CKD only)
    pub heads: u32,
    /// Number of tracks (CKD) or block-groups (FBA)
    pub slots: u64,
    /// Largest stored or expanded image
    pub max_image: usize,
}

/// Outcome of checking one image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    /// Known method this build cannot decode
    Unsupported(u8),
    Invalid(&'static str),
}

impl DeviceLimits {
    pub fn new(class: DeviceClass, geometry: &Geometry, heads: u32, slots: u64) -> Self {
        DeviceLimits {
            class,
            heads,
            slots,
            max_image: geometry.max_image_size(),
        }
    }

    /// Slot number encoded in an image header, if it is in range
    pub fn index_of(&self, header: &[u8]) -> Option<u64> {
        if header.len() < IMAGE_HEADER_SIZE {
            return None;
        }
        match self.class {
            DeviceClass::Ckd => {
                let cc = u16::from_be_bytes([header[1], header[2]]) as u64;
                let hh = u16::from_be_bytes([header[3], header[4]]) as u64;
                if self.heads == 0 || hh >= self.heads as u64 {
                    return None;
                }
                let index = cc * self.heads as u64 + hh;
                (index < self.slots).then_some(index)
            }
            DeviceClass::Fba => {
                let group =
                    u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as u64;
                (group < self.slots).then_some(group)
            }
        }
    }

    /// Smallest stored length worth considering
    pub fn min_image(&self) -> usize {
        IMAGE_HEADER_SIZE + 1
    }

    /// Largest expanded body
    pub fn max_body(&self) -> usize {
        match self.class {
            DeviceClass::Ckd => self.max_image - IMAGE_HEADER_SIZE,
            DeviceClass::Fba => FBA_GROUP_SIZE - IMAGE_HEADER_SIZE,
        }
    }

    /// Level 2: sanity of the stored header alone
    pub fn check_header(&self, header: &[u8], expected: u64) -> Verdict {
        if header.len() < IMAGE_HEADER_SIZE {
            return Verdict::Invalid("image shorter than its header");
        }
        let method = match CompressionMethod::from_u8(header[0]) {
            Some(method) => method,
            None => return Verdict::Invalid("unknown compression tag"),
        };
        if self.index_of(header) != Some(expected) {
            return Verdict::Invalid("header does not name its own slot");
        }
        if !method.is_supported() {
            return Verdict::Unsupported(header[0]);
        }
        Verdict::Valid
    }

    /// Level 3: full structural validation through decompression
    pub fn check_image(&self, stored: &[u8], expected: u64) -> Verdict {
        match self.check_header(stored, expected) {
            Verdict::Valid => {}
            other => return other,
        }
        match self.expand(stored) {
            Ok(expanded) if self.is_valid_expanded(&expanded) => Verdict::Valid,
            Ok(_) => Verdict::Invalid("expanded image is malformed"),
            Err(_) => Verdict::Invalid("image body does not decompress"),
        }
    }

    /// Expand a stored image
    pub fn expand(&self, stored: &[u8]) -> Result<Vec<u8>> {
        if stored.len() < IMAGE_HEADER_SIZE {
            return Err(CckdError::Compression("image shorter than its header".into()));
        }
        let method = CompressionMethod::from_u8(stored[0]).ok_or_else(|| {
            CckdError::Compression(format!("unknown compression tag {}", stored[0]))
        })?;
        let body = compression::decompress(&stored[IMAGE_HEADER_SIZE..], method, self.max_body())?;
        Ok(assemble(&stored[1..IMAGE_HEADER_SIZE], &body))
    }

    /// Structural check of an expanded image
    pub fn is_valid_expanded(&self, expanded: &[u8]) -> bool {
        match self.class {
            DeviceClass::Ckd => {
                expanded.len() <= self.max_image && ckd_track_end(expanded) == Some(expanded.len())
            }
            DeviceClass::Fba => expanded.len() == FBA_GROUP_SIZE,
        }
    }
}

/// Expanded image from the four header bytes and a decoded body
pub(crate) fn assemble(header: &[u8], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(IMAGE_HEADER_SIZE + body.len());
    out.push(0);
    out.extend_from_slice(header);
    out.extend_from_slice(body);
    out
}

/// Check record 0 directly after the image header
///
/// Record 0 must repeat the header's cylinder and head, have record number
/// zero, no key and exactly 8 data bytes.
pub fn ckd_r0_matches(image: &[u8]) -> bool {
    let r0 = IMAGE_HEADER_SIZE;
    if image.len() < r0 + CKD_COUNT_SIZE {
        return false;
    }
    image[1..5] == image[r0..r0 + 4]
        && image[r0 + 4] == 0
        && image[r0 + 5] == 0
        && u16::from_be_bytes([image[r0 + 6], image[r0 + 7]]) as usize == CKD_R0_DATA_LEN
}

/// Offset just past the end-of-track marker, following the record chain
pub fn ckd_track_end(expanded: &[u8]) -> Option<usize> {
    if !ckd_r0_matches(expanded) {
        return None;
    }
    let mut pos = IMAGE_HEADER_SIZE + CKD_COUNT_SIZE + CKD_R0_DATA_LEN;
    loop {
        let count = expanded.get(pos..pos + CKD_COUNT_SIZE)?;
        if count == EOT_MARKER {
            return Some(pos + CKD_COUNT_SIZE);
        }
        let kl = count[5] as usize;
        let dl = u16::from_be_bytes([count[6], count[7]]) as usize;
        pos += CKD_COUNT_SIZE + kl + dl;
    }
}

/// Build a stored image from an expanded one
pub fn compress_image(expanded: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    if expanded.len() < IMAGE_HEADER_SIZE {
        return Err(CckdError::Compression("image shorter than its header".into()));
    }
    let body = compression::compress(&expanded[IMAGE_HEADER_SIZE..], method)?;
    let mut stored = Vec::with_capacity(IMAGE_HEADER_SIZE + body.len());
    stored.push(method as u8);
    stored.extend_from_slice(&expanded[1..IMAGE_HEADER_SIZE]);
    stored.extend_from_slice(&body);
    Ok(stored)
}

/// Expanded CKD track with record 0 and the given user records
///
/// Each record is `(record number, key, data)`.
pub fn build_ckd_track(cyl: u16, head: u16, records: &[(u8, &[u8], &[u8])]) -> Vec<u8> {
    let mut track = Vec::new();
    track.push(0);
    track.extend_from_slice(&cyl.to_be_bytes());
    track.extend_from_slice(&head.to_be_bytes());

    track.extend_from_slice(&cyl.to_be_bytes());
    track.extend_from_slice(&head.to_be_bytes());
    track.extend_from_slice(&[0, 0]);
    track.extend_from_slice(&(CKD_R0_DATA_LEN as u16).to_be_bytes());
    track.extend_from_slice(&[0u8; CKD_R0_DATA_LEN]);

    for (rec, key, data) in records {
        track.extend_from_slice(&cyl.to_be_bytes());
        track.extend_from_slice(&head.to_be_bytes());
        track.push(*rec);
        track.push(key.len() as u8);
        track.extend_from_slice(&(data.len() as u16).to_be_bytes());
        track.extend_from_slice(key);
        track.extend_from_slice(data);
    }

    track.extend_from_slice(&EOT_MARKER);
    track
}

/// Expanded FBA block-group image filled by `fill(block_index, block)`
pub fn build_fba_group(group: u32, mut fill: impl FnMut(usize, &mut [u8])) -> Vec<u8> {
    let mut image = vec![0u8; FBA_GROUP_SIZE];
    image[1..IMAGE_HEADER_SIZE].copy_from_slice(&group.to_be_bytes());
    for (i, block) in image[IMAGE_HEADER_SIZE..]
        .chunks_exact_mut(crate::geometry::FBA_BLOCK_SIZE)
        .enumerate()
    {
        fill(i, block);
    }
    image
}
