// src/fingerprint.rs
//
// Fingerprint engine: locality-preserving fuzzy digests over message content.
//
// Construction is the classic TLSH scheme: a 5-byte window slides over the
// input, six salted Pearson triplet hashes feed 128 counting buckets, and the
// digest body encodes each bucket as a 2-bit quartile code. The header packs
// the running checksum, the log-bucketed input length, and the two quartile
// ratios as one byte each, giving the fixed digest shape:
//
//   "T1" + 8 hex header chars + 64 hex body chars  (74 chars, upper-case)
//
// Distance between two digests correlates with how similar the inputs were:
// 0 means identical, and anything under ~70 is a near-variant. The band
// extractor slides a 6-char window with stride 3 over the body, producing the
// 20 indexed substrings used as inverted-index keys for candidate retrieval.

use std::fmt;

use thiserror::Error;

/// Shortest input the digest construction accepts.
pub const MIN_INPUT_LEN: usize = 50;

/// Hex chars in the digest after the "T1" marker: 8 header + 64 body.
pub const DIGEST_HEX_LEN: usize = 72;

/// Bands emitted per well-formed digest (window 6, stride 3 over 64 chars).
pub const BAND_COUNT: usize = 20;

/// Bands two digests must share before they are treated as LSH candidates.
pub const MIN_BAND_MATCHES: usize = 4;

const WINDOW: usize = 5;
const BUCKETS: usize = 128;
const CODE_BYTES: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("input too short to fingerprint: {0} bytes, need at least {MIN_INPUT_LEN}")]
    InputTooShort(usize),
    #[error("fingerprint construction failed: {0}")]
    Internal(&'static str),
}

// Pearson permutation table (the classic 1990 table, as used by TLSH).
#[rustfmt::skip]
const PEARSON: [u8; 256] = [
      1,  87,  49,  12, 176, 178, 102, 166, 121, 193,   6,  84, 249, 230,  44, 163,
     14, 197, 213, 181, 161,  85, 218,  80,  64, 239,  24, 226, 236, 142,  38, 200,
    110, 177, 104, 103, 141, 253, 255,  50,  77, 101,  81,  18,  45,  96,  31, 222,
     25, 107, 190,  70,  86, 237, 240,  34,  72, 242,  20, 214, 244, 227, 149, 235,
     97, 234,  57,  22,  60, 250,  82, 175, 208,   5, 127, 199, 111,  62, 135, 248,
    174, 169, 211,  58,  66, 154, 106, 195, 245, 171,  17, 187, 182, 179,   0, 243,
    132,  56, 148,  75, 128, 133, 158, 100, 130, 126,  91,  13, 153, 246, 216, 219,
    119,  68, 223,  78,  83,  88, 201,  99, 122,  11,  92,  32, 136, 114,  52,  10,
    138,  30,  48, 183, 156,  35,  61,  26, 143,  74, 251,  94, 129, 162,  63, 152,
    170,   7, 115, 167, 241, 206,   3, 150,  55,  59, 151, 220,  90,  53,  23, 131,
    125, 173,  15, 238,  79,  95,  89,  16, 105, 137, 225, 224, 217, 160,  37, 123,
    118,  73,   2, 157,  46, 116,   9, 145, 134, 228, 207, 212, 202, 215,  69, 229,
     27, 188,  67, 124, 168, 252,  42,   4,  29, 108,  21, 247,  19, 205,  39, 203,
    233,  40, 186, 147, 198, 192, 155,  33, 164, 191,  98, 204, 165, 180, 117,  76,
    140,  36, 210, 172,  41,  54, 159,   8, 185, 232, 113, 196, 231,  47, 146, 120,
     51,  65,  28, 144, 254, 221,  93, 189, 194, 139, 112,  43,  71, 109, 184, 209,
];

#[inline]
fn b_mapping(salt: u8, i: u8, j: u8, k: u8) -> u8 {
    let mut h = PEARSON[salt as usize];
    h = PEARSON[(h ^ i) as usize];
    h = PEARSON[(h ^ j) as usize];
    h = PEARSON[(h ^ k) as usize];
    h
}

// Logarithmic length bucketing: fine-grained for short inputs, coarser as
// inputs grow, wrapping into a single byte.
fn l_capturing(len: usize) -> u8 {
    let n = len as f64;
    let l = if len <= 656 {
        n.ln() / 1.5f64.ln()
    } else if len <= 3199 {
        n.ln() / 1.3f64.ln() - 8.727_77
    } else {
        n.ln() / 1.1f64.ln() - 62.547_2
    };
    (l as i64 & 0xFF) as u8
}

/// Compute the digest of `data`.
///
/// Fails with `InputTooShort` under [`MIN_INPUT_LEN`] bytes and `Internal`
/// when the input has too little byte-level variation to fill the quartiles
/// (long runs of a single byte, for instance).
pub fn compute(data: &[u8]) -> Result<String, FingerprintError> {
    if data.len() < MIN_INPUT_LEN {
        return Err(FingerprintError::InputTooShort(data.len()));
    }

    let mut buckets = [0u32; 256];
    let mut checksum = 0u8;

    for i in (WINDOW - 1)..data.len() {
        // w0 is the newest byte, w4 the oldest in the window.
        let (w0, w1, w2, w3, w4) =
            (data[i], data[i - 1], data[i - 2], data[i - 3], data[i - 4]);
        checksum = b_mapping(0, w0, w1, checksum);
        buckets[b_mapping(2, w0, w1, w2) as usize] += 1;
        buckets[b_mapping(3, w0, w1, w3) as usize] += 1;
        buckets[b_mapping(5, w0, w2, w3) as usize] += 1;
        buckets[b_mapping(7, w0, w2, w4) as usize] += 1;
        buckets[b_mapping(11, w0, w1, w4) as usize] += 1;
        buckets[b_mapping(13, w0, w3, w4) as usize] += 1;
    }

    let eff = &buckets[..BUCKETS];
    let mut sorted = [0u32; BUCKETS];
    sorted.copy_from_slice(eff);
    sorted.sort_unstable();
    let (q1, q2, q3) = (sorted[31], sorted[63], sorted[95]);
    if q3 == 0 {
        return Err(FingerprintError::Internal("insufficient bucket variation"));
    }

    let q1_ratio = ((q1 as u64 * 100 / q3 as u64) % 16) as u8;
    let q2_ratio = ((q2 as u64 * 100 / q3 as u64) % 16) as u8;

    let mut code = [0u8; CODE_BYTES];
    for (i, &count) in eff.iter().enumerate() {
        let two: u8 = if count <= q1 {
            0
        } else if count <= q2 {
            1
        } else if count <= q3 {
            2
        } else {
            3
        };
        code[i / 4] |= two << ((i % 4) * 2);
    }

    let mut raw = Vec::with_capacity(4 + CODE_BYTES);
    raw.extend_from_slice(&[checksum, l_capturing(data.len()), q1_ratio, q2_ratio]);
    raw.extend_from_slice(&code);

    Ok(format!("T1{}", hex::encode(raw).to_ascii_uppercase()))
}

// ── Parsed form ───────────────────────────────────────────────────────────────

/// A digest decoded back into its header and body, so a batch of comparisons
/// against one reference parses every string exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDigest {
    header: [u8; 4],
    code:   [u8; CODE_BYTES],
}

impl ParsedDigest {
    /// Decode a digest string. The "T1" marker is optional; anything with
    /// fewer than 72 hex chars after it, or with non-hex content, is
    /// malformed and yields `None`.
    pub fn parse(digest: &str) -> Option<Self> {
        let hex_part = hex_part(digest)?;
        let raw = hex::decode(&hex_part[..DIGEST_HEX_LEN]).ok()?;
        let mut header = [0u8; 4];
        header.copy_from_slice(&raw[..4]);
        let mut code = [0u8; CODE_BYTES];
        code.copy_from_slice(&raw[4..]);
        Some(Self { header, code })
    }

    /// Symmetric, non-negative distance. 0 means identical digests.
    pub fn distance(&self, other: &Self) -> u32 {
        let mut dist = 0u32;

        // Checksum mismatch is a flat penalty.
        if self.header[0] != other.header[0] {
            dist += 1;
        }

        // Log-length difference, circular over the byte range.
        let ldiff = mod_diff(self.header[1], other.header[1], 256);
        dist += if ldiff <= 1 { ldiff } else { ldiff * 12 };

        // Quartile ratios, circular over their mod-16 range.
        for idx in [2, 3] {
            let qdiff = mod_diff(self.header[idx] % 16, other.header[idx] % 16, 16);
            dist += if qdiff <= 1 { qdiff } else { (qdiff - 1) * 12 };
        }

        // Body: per 2-bit quartile code, with a jump penalty for codes at
        // opposite extremes.
        for (a, b) in self.code.iter().zip(other.code.iter()) {
            for shift in [0u8, 2, 4, 6] {
                let x = (a >> shift) & 3;
                let y = (b >> shift) & 3;
                let d = x.abs_diff(y) as u32;
                dist += if d == 3 { 6 } else { d };
            }
        }

        dist
    }
}

impl fmt::Display for ParsedDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut raw = Vec::with_capacity(4 + CODE_BYTES);
        raw.extend_from_slice(&self.header);
        raw.extend_from_slice(&self.code);
        write!(f, "T1{}", hex::encode(raw).to_ascii_uppercase())
    }
}

fn hex_part(digest: &str) -> Option<&str> {
    let part = digest.strip_prefix("T1").unwrap_or(digest);
    if !part.is_ascii() || part.len() < DIGEST_HEX_LEN {
        return None;
    }
    Some(part)
}

fn mod_diff(a: u8, b: u8, range: u32) -> u32 {
    let d = (i32::from(a) - i32::from(b)).unsigned_abs();
    d.min(range - d)
}

/// Distance between two digest strings, `None` if either is malformed.
pub fn distance(a: &str, b: &str) -> Option<u32> {
    Some(ParsedDigest::parse(a)?.distance(&ParsedDigest::parse(b)?))
}

/// Distances from `reference` to each candidate, in candidate order.
/// Malformed candidates are skipped silently; a malformed reference yields
/// an empty result.
pub fn batch_distance(reference: &str, candidates: &[String]) -> Vec<(String, u32)> {
    let Some(reference) = ParsedDigest::parse(reference) else {
        return Vec::new();
    };
    candidates
        .iter()
        .filter_map(|c| {
            ParsedDigest::parse(c).map(|parsed| (c.clone(), reference.distance(&parsed)))
        })
        .collect()
}

/// Indexed LSH bands of a digest body: `"1:AABBCC"` through `"20:......"`.
/// Malformed digests yield an empty set so they can never enter an index.
pub fn bands(digest: &str) -> Vec<String> {
    let Some(part) = hex_part(digest) else {
        return Vec::new();
    };
    let body = &part[8..DIGEST_HEX_LEN];
    let mut out = Vec::with_capacity(BAND_COUNT);
    let mut pos = 0;
    let mut idx = 1;
    while pos + 6 <= body.len() {
        out.push(format!("{}:{}", idx, &body[pos..pos + 6]));
        pos += 3;
        idx += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Your account has been locked pending verification. \
        Review the attached statement and confirm your details through the \
        secure portal before access is suspended permanently.";

    fn sample_digest() -> String {
        compute(SAMPLE.as_bytes()).unwrap()
    }

    #[test]
    fn pearson_table_is_a_permutation() {
        let mut seen = [false; 256];
        for &v in PEARSON.iter() {
            assert!(!seen[v as usize], "duplicate entry {v}");
            seen[v as usize] = true;
        }
    }

    #[test]
    fn digest_has_fixed_shape() {
        let d = sample_digest();
        assert_eq!(d.len(), 2 + DIGEST_HEX_LEN);
        assert!(d.starts_with("T1"));
        assert!(d[2..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn short_input_is_rejected() {
        assert_eq!(
            compute(b"too short"),
            Err(FingerprintError::InputTooShort(9))
        );
    }

    #[test]
    fn monotone_input_is_rejected() {
        // A run of one byte fills at most a handful of buckets, so the upper
        // quartile stays empty.
        let data = vec![b'a'; 120];
        assert_eq!(
            compute(&data),
            Err(FingerprintError::Internal("insufficient bucket variation"))
        );
    }

    #[test]
    fn distance_to_self_is_zero() {
        let d = sample_digest();
        assert_eq!(distance(&d, &d), Some(0));
    }

    #[test]
    fn distance_is_symmetric() {
        let a = sample_digest();
        let b = compute(SAMPLE.replace("locked", "frozen").as_bytes()).unwrap();
        assert_eq!(distance(&a, &b), distance(&b, &a));
        assert!(distance(&a, &b).unwrap() > 0);
    }

    #[test]
    fn near_variants_score_closer_than_unrelated_content() {
        let a = sample_digest();
        let near = compute(SAMPLE.replace("locked", "frozen").as_bytes()).unwrap();
        let far = compute(
            b"Minutes from the quarterly planning meeting, with agenda items, \
              attendance, follow-up owners and the revised delivery schedule."
                .as_slice(),
        )
        .unwrap();
        assert!(distance(&a, &near).unwrap() < distance(&a, &far).unwrap());
    }

    #[test]
    fn parse_accepts_marker_and_bare_hex() {
        let d = sample_digest();
        let bare = d.strip_prefix("T1").unwrap();
        assert_eq!(ParsedDigest::parse(&d), ParsedDigest::parse(bare));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(ParsedDigest::parse("T1ABC").is_none());
        assert!(ParsedDigest::parse("").is_none());
        assert!(ParsedDigest::parse(&"G".repeat(74)).is_none());
    }

    #[test]
    fn display_round_trips() {
        let d = sample_digest();
        assert_eq!(ParsedDigest::parse(&d).unwrap().to_string(), d);
    }

    #[test]
    fn batch_matches_pairwise_and_skips_malformed() {
        let a = sample_digest();
        let b = compute(SAMPLE.replace("locked", "frozen").as_bytes()).unwrap();
        let candidates = vec![b.clone(), "not-a-digest".to_string(), a.clone()];
        let out = batch_distance(&a, &candidates);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], (b.clone(), distance(&a, &b).unwrap()));
        assert_eq!(out[1], (a.clone(), 0));
    }

    #[test]
    fn batch_with_malformed_reference_is_empty() {
        assert!(batch_distance("junk", &[sample_digest()]).is_empty());
    }

    #[test]
    fn bands_have_expected_count_and_shape() {
        let d = sample_digest();
        let bs = bands(&d);
        assert_eq!(bs.len(), BAND_COUNT);
        for (i, band) in bs.iter().enumerate() {
            let (idx, chunk) = band.split_once(':').unwrap();
            assert_eq!(idx.parse::<usize>().unwrap(), i + 1);
            assert_eq!(chunk.len(), 6);
            assert!(chunk.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn bands_overlap_window_content() {
        // Stride 3 with window 6: band n+1 starts halfway into band n.
        let d = sample_digest();
        let bs = bands(&d);
        let first = bs[0].split_once(':').unwrap().1;
        let second = bs[1].split_once(':').unwrap().1;
        assert_eq!(&first[3..], &second[..3]);
    }

    #[test]
    fn bands_of_malformed_digest_are_empty() {
        assert!(bands("T1ABCDEF").is_empty());
        assert!(bands("").is_empty());
    }

    #[test]
    fn identical_content_shares_all_bands() {
        let a = sample_digest();
        let b = compute(SAMPLE.as_bytes()).unwrap();
        assert_eq!(bands(&a), bands(&b));
    }

    // Exact-distance checks against hand-built digests: the all-zero body
    // paired with bumped hex digits ('1' contributes 1, '5' contributes 2).
    fn synthetic(body: &str) -> String {
        assert_eq!(body.len(), 64);
        format!("T100000000{body}")
    }

    #[test]
    fn body_code_distances_are_exact() {
        let zero = synthetic(&"0".repeat(64));
        let one = synthetic(&format!("1{}", "0".repeat(63)));
        let seventy = synthetic(&format!("{}{}", "5".repeat(35), "0".repeat(29)));
        assert_eq!(distance(&zero, &one), Some(1));
        assert_eq!(distance(&zero, &seventy), Some(70));
    }

    #[test]
    fn header_length_difference_scales() {
        let a = "T100000000".to_string() + &"0".repeat(64);
        let b = "T100010000".to_string() + &"0".repeat(64);
        let c = "T100050000".to_string() + &"0".repeat(64);
        assert_eq!(distance(&a, &b), Some(1));
        assert_eq!(distance(&a, &c), Some(60));
    }
}
