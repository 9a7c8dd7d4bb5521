use std::collections::BTreeMap;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

/// Packs a `BLOCKxTXxOUT` short channel id into its u64 form.
pub fn to_short_channel_id(id: &str) -> Result<u64> {
    let parts: Vec<&str> = id.trim().split(['x', 'X']).collect();
    anyhow::ensure!(parts.len() == 3, "wrong channel id: {id}");

    let block: u64 = parts[0]
        .parse()
        .with_context(|| format!("parse block of channel id {id}"))?;
    let tx_index: u64 = parts[1]
        .parse()
        .with_context(|| format!("parse tx index of channel id {id}"))?;
    let output: u64 = parts[2]
        .parse()
        .with_context(|| format!("parse output of channel id {id}"))?;

    Ok(((block & 0xff_ffff) << 40) | ((tx_index & 0xff_ffff) << 16) | (output & 0xffff))
}

/// Parses an amount that is either a plain msat integer or a `"<n>msat"` string.
pub fn parse_msat(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim_end_matches("msat").parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFeature {
    pub name: String,
    pub is_known: bool,
    pub is_required: bool,
}

/// Decodes a hex feature bit-field. Bit 0 is the least significant bit;
/// even bits are "required", odd bits "optional".
pub fn decode_features(hex_bits: &str) -> Result<BTreeMap<u32, NodeFeature>> {
    let mut out = BTreeMap::new();
    for (nibble_index, c) in hex_bits.trim().chars().rev().enumerate() {
        let nibble = c
            .to_digit(16)
            .with_context(|| format!("invalid hex digit {c:?} in feature bits"))?;
        for offset in 0..4u32 {
            if nibble & (1 << offset) == 0 {
                continue;
            }
            let bit = nibble_index as u32 * 4 + offset;
            let name = feature_name(bit);
            out.insert(
                bit,
                NodeFeature {
                    name: name.unwrap_or_default().to_string(),
                    is_known: name.is_some(),
                    is_required: bit % 2 == 0,
                },
            );
        }
    }
    Ok(out)
}

fn feature_name(bit: u32) -> Option<&'static str> {
    let name = match bit / 2 {
        0 => "option_data_loss_protect",
        2 => "option_upfront_shutdown_script",
        3 => "gossip_queries",
        4 => "var_onion_optin",
        5 => "gossip_queries_ex",
        6 => "option_static_remotekey",
        7 => "payment_secret",
        8 => "basic_mpp",
        9 => "option_support_large_channel",
        11 => "option_anchors_zero_fee_htlc_tx",
        12 => "option_route_blinding",
        13 => "option_shutdown_anysegwit",
        14 => "option_dual_fund",
        17 => "option_quiesce",
        19 => "option_onion_messages",
        22 => "option_channel_type",
        23 => "option_scid_alias",
        24 => "option_payment_metadata",
        25 => "option_zeroconf",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_channel_id_packs_block_tx_and_output() {
        assert_eq!(to_short_channel_id("117x1x0").unwrap(), 128_642_860_515_328);
        assert_eq!(to_short_channel_id("0x0x7").unwrap(), 7);

        assert!(to_short_channel_id("117x1").is_err());
        assert!(to_short_channel_id("axbxc").is_err());
    }

    #[test]
    fn msat_amounts_accept_both_encodings() {
        assert_eq!(parse_msat(&serde_json::json!(1500)), Some(1500));
        assert_eq!(parse_msat(&serde_json::json!("2000msat")), Some(2000));
        assert_eq!(parse_msat(&serde_json::json!("nope")), None);
        assert_eq!(parse_msat(&serde_json::Value::Null), None);
    }

    #[test]
    fn feature_bits_are_little_endian() {
        // 0x2 -> bit 1 (optional data_loss_protect); 0x100 -> bit 8 (required var_onion)
        let features = decode_features("102").unwrap();
        assert_eq!(features.len(), 2);

        let dlp = &features[&1];
        assert!(!dlp.is_required);
        assert_eq!(dlp.name, "option_data_loss_protect");

        let onion = &features[&8];
        assert!(onion.is_required);
        assert!(onion.is_known);

        let unknown = decode_features("8000000000000000000000000000000000").unwrap();
        let (bit, feature) = unknown.iter().next().unwrap();
        assert_eq!(*bit, 135);
        assert!(!feature.is_known);

        assert!(decode_features("zz").is_err());
        assert!(decode_features("").unwrap().is_empty());
    }
}
