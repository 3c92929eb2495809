//! C5 — WatermarkEngine: per-recipient visible and forensic watermark
//! artifacts. Policy levels stack: NONE < STANDARD < FORENSIC <
//! MAXIMUM, each adding more to the bundle than the last.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::intake::WatermarkPolicy;

/// The five zero-width code points used to encode invisible markers. Each
/// hex digit (0-15) becomes two base-5 digits, each mapped to one of
/// these.
const ZW_ALPHABET: [char; 5] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}'];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkRequest {
    pub document_id: String,
    pub title: String,
    pub recipient_name: String,
    pub recipient_email: String,
    pub recipient_ip: Option<String>,
    pub policy: WatermarkPolicy,
    pub confidentiality_notice: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkResult {
    pub watermark_id: String,
    pub watermark_hash: String,
    pub visible_text: Option<String>,
    pub footer_hash: Option<String>,
    pub css_style: Option<String>,
    pub svg: Option<String>,
    pub policy: WatermarkPolicy,
    pub invisible_markers: Option<String>,
    pub spacing_pattern: Option<Vec<f64>>,
}

fn visible_text(name: &str, email: &str, timestamp: &DateTime<Utc>) -> String {
    format!(
        "CONFIDENTIAL — {name} — {email} — {} {}",
        timestamp.format("%Y-%m-%d"),
        timestamp.format("%H:%M:%S")
    )
}

fn footer_hash(watermark_hash: &str, document_id: &str) -> String {
    let doc_prefix: String = document_id.chars().take(8).collect();
    format!("SDC-{}-{doc_prefix}", &watermark_hash[..8])
}

/// Encode the first 16 hex chars of `watermark_hash` into zero-width
/// characters: each hex digit becomes two base-5 digits, each digit
/// picking one of [`ZW_ALPHABET`].
pub fn generate_invisible_markers(hex_hash: &str) -> String {
    let prefix: &str = &hex_hash[..hex_hash.len().min(16)];
    let mut out = String::new();
    for c in prefix.chars() {
        let digit = c.to_digit(16).unwrap_or(0) as u8;
        let hi = digit / 5;
        let lo = digit % 5;
        out.push(ZW_ALPHABET[hi as usize]);
        out.push(ZW_ALPHABET[lo as usize]);
    }
    out
}

/// Decode a zero-width marker sequence back into its hex prefix. Must
/// iterate by Unicode scalar value, not by byte.
pub fn decode_invisible_markers(text: &str) -> String {
    let marks: Vec<char> = text.chars().filter(|c| ZW_ALPHABET.contains(c)).collect();
    let mut out = String::new();
    for pair in marks.chunks(2) {
        if pair.len() < 2 {
            break;
        }
        let hi = ZW_ALPHABET.iter().position(|&z| z == pair[0]).unwrap_or(0) as u32;
        let lo = ZW_ALPHABET.iter().position(|&z| z == pair[1]).unwrap_or(0) as u32;
        let digit = hi * 5 + lo;
        if let Some(c) = std::char::from_digit(digit, 16) {
            out.push(c);
        }
    }
    out
}

/// Distribute marker characters at approximately equal word-interval
/// positions within `text`.
pub fn inject_invisible_markers(text: &str, markers: &str) -> String {
    let marker_chars: Vec<char> = markers.chars().collect();
    if marker_chars.is_empty() {
        return text.to_string();
    }
    let words: Vec<&str> = text.split(' ').collect();
    if words.is_empty() {
        return markers.to_string() + text;
    }
    let interval = std::cmp::max(1, words.len() / marker_chars.len());

    let mut out = String::new();
    let mut marker_idx = 0;
    for (i, word) in words.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(word);
        if marker_idx < marker_chars.len() && i % interval == 0 {
            out.push(marker_chars[marker_idx]);
            marker_idx += 1;
        }
    }
    while marker_idx < marker_chars.len() {
        out.push(marker_chars[marker_idx]);
        marker_idx += 1;
    }
    out
}

/// Bytes 16..48 of the hex hash, each mapped to an em deviation in
/// roughly [-0.03, 0.03].
fn spacing_pattern(hex_hash: &str) -> Vec<f64> {
    let bytes: Vec<u8> = (0..16)
        .filter_map(|i| {
            let start = 16 + i * 2;
            hex_hash.get(start..start + 2).and_then(|s| u8::from_str_radix(s, 16).ok())
        })
        .collect();
    bytes
        .into_iter()
        .map(|b| {
            let raw = (b as f64 / 255.0) * 0.06 - 0.03;
            (raw * 10000.0).round() / 10000.0
        })
        .collect()
}

pub fn generate(req: &WatermarkRequest) -> WatermarkResult {
    let timestamp = Utc::now();
    let watermark_id = format!("wm-{}", crypto_primitives::SecureRandom::hex(8));
    let watermark_hash = crypto_primitives::sha256_hex(
        format!(
            "{watermark_id}|{}|{}|{}|{}",
            req.document_id,
            req.recipient_email,
            req.recipient_ip.as_deref().unwrap_or(""),
            timestamp.to_rfc3339()
        )
        .as_bytes(),
    );

    if matches!(req.policy, WatermarkPolicy::None) {
        return WatermarkResult {
            watermark_id,
            watermark_hash,
            visible_text: None,
            footer_hash: None,
            css_style: None,
            svg: None,
            policy: req.policy,
            invisible_markers: None,
            spacing_pattern: None,
        };
    }

    let visible = visible_text(&req.recipient_name, &req.recipient_email, &timestamp);
    let footer = footer_hash(&watermark_hash, &req.document_id);
    let css = format!(
        "position:absolute;opacity:0.15;transform:rotate(-30deg);font-size:24px;content:'{visible}';"
    );
    let svg = format!(
        "<svg xmlns='http://www.w3.org/2000/svg'><text transform='rotate(-30)' opacity='0.15'>{visible}</text></svg>"
    );

    let (invisible_markers, pattern) = match req.policy {
        WatermarkPolicy::Standard => (None, None),
        WatermarkPolicy::Forensic => (Some(generate_invisible_markers(&watermark_hash)), None),
        WatermarkPolicy::Maximum => (
            Some(generate_invisible_markers(&watermark_hash)),
            Some(spacing_pattern(&watermark_hash)),
        ),
        WatermarkPolicy::None => unreachable!(),
    };

    WatermarkResult {
        watermark_id,
        watermark_hash,
        visible_text: Some(visible),
        footer_hash: Some(footer),
        css_style: Some(css),
        svg: Some(svg),
        policy: req.policy,
        invisible_markers,
        spacing_pattern: pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_policy_produces_empty_bundle() {
        let req = WatermarkRequest {
            document_id: "doc-1".to_string(),
            title: "Doc".to_string(),
            recipient_name: "Alice".to_string(),
            recipient_email: "alice@example.com".to_string(),
            recipient_ip: None,
            policy: WatermarkPolicy::None,
            confidentiality_notice: String::new(),
        };
        let result = generate(&req);
        assert!(result.visible_text.is_none());
        assert!(result.invisible_markers.is_none());
    }

    #[test]
    fn property10_decode_round_trips_first_16_hex_chars() {
        let hex_hash = crypto_primitives::sha256_hex(b"any seed for a forensic watermark");
        let expected_prefix: String = hex_hash.chars().take(16).collect();
        let markers = generate_invisible_markers(&hex_hash);
        let injected = inject_invisible_markers("the quick brown fox jumps over the lazy dog", &markers);
        let decoded = decode_invisible_markers(&injected);
        assert_eq!(decoded, expected_prefix);
    }

    #[test]
    fn maximum_policy_includes_spacing_pattern_in_range() {
        let req = WatermarkRequest {
            document_id: "doc-1".to_string(),
            title: "Doc".to_string(),
            recipient_name: "Alice".to_string(),
            recipient_email: "alice@example.com".to_string(),
            recipient_ip: Some("1.2.3.4".to_string()),
            policy: WatermarkPolicy::Maximum,
            confidentiality_notice: String::new(),
        };
        let result = generate(&req);
        let pattern = result.spacing_pattern.unwrap();
        assert_eq!(pattern.len(), 16);
        for v in pattern {
            assert!((-0.03..=0.03).contains(&v));
        }
    }

    #[test]
    fn forensic_adds_markers_but_not_spacing() {
        let req = WatermarkRequest {
            document_id: "doc-1".to_string(),
            title: "Doc".to_string(),
            recipient_name: "Alice".to_string(),
            recipient_email: "alice@example.com".to_string(),
            recipient_ip: None,
            policy: WatermarkPolicy::Forensic,
            confidentiality_notice: String::new(),
        };
        let result = generate(&req);
        assert!(result.invisible_markers.is_some());
        assert!(result.spacing_pattern.is_none());
    }
}
