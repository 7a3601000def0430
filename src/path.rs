//! Derivation path templates and expansion.
//!
//! A wallet stores its path skeleton as a list of segments such as
//! `["m", "purpose'", "coin_type'", "account'", "change", "address_index"]`.
//! [`expand`] turns a partial request like `[0, 5]` into a concrete path by
//! filling the trailing template positions with the explicit values and the
//! remaining tokens with values taken from a [`PathContext`].

use crate::network::Network;
use crate::primitives::bip32::{hardened, BIP32_HARDENED_KEY_LIMIT};
use crate::types::{Scheme, WitnessType};
use crate::{Result, WalletError};

pub const HARDENED_MARK: char = '\'';

const TOKENS: [&str; 8] = [
    "purpose",
    "coin_type",
    "account",
    "script_type",
    "cosigner_index",
    "cosigner_id",
    "change",
    "address_index",
];

/// Values substituted for template tokens.
#[derive(Debug, Clone)]
pub struct PathContext {
    pub network: Network,
    pub purpose: u32,
    pub account_id: u32,
    pub witness_type: WitnessType,
    pub cosigner_id: Option<u32>,
    pub change: u32,
    pub address_index: u32,
}

impl PathContext {
    fn value_of(&self, token: &str) -> Result<Option<u32>> {
        let value = match token {
            "purpose" => Some(self.purpose),
            "coin_type" => Some(self.network.params().bip44_coin_type),
            "account" => Some(self.account_id),
            "script_type" => Some(self.witness_type.script_type_index()),
            "cosigner_index" | "cosigner_id" => self.cosigner_id,
            "change" => Some(self.change),
            "address_index" => Some(self.address_index),
            other => {
                return Err(WalletError::Path(format!(
                    "Variable {} not found in key structure definitions",
                    other
                )))
            }
        };
        Ok(value)
    }
}

/// Canonical key path and purpose for a wallet layout.
pub fn template_for(scheme: Scheme, witness_type: WitnessType, multisig: bool) -> (Vec<String>, u32) {
    let segments: &[&str] = match (scheme, multisig, witness_type) {
        (Scheme::Single, _, _) => &["m"],
        (Scheme::Bip32, false, _) => &["m", "purpose'", "coin_type'", "account'", "change", "address_index"],
        (Scheme::Bip32, true, WitnessType::Legacy) => &["m", "purpose'", "cosigner_index", "change", "address_index"],
        (Scheme::Bip32, true, _) => &[
            "m",
            "purpose'",
            "coin_type'",
            "account'",
            "script_type'",
            "change",
            "address_index",
        ],
    };
    let purpose = match (scheme, multisig, witness_type) {
        (Scheme::Single, _, _) => 0,
        (Scheme::Bip32, false, WitnessType::Legacy) => 44,
        (Scheme::Bip32, false, WitnessType::P2shSegwit) => 49,
        (Scheme::Bip32, false, WitnessType::Segwit) => 84,
        (Scheme::Bip32, true, WitnessType::Legacy) => 45,
        (Scheme::Bip32, true, _) => 48,
    };
    (segments.iter().map(|s| s.to_string()).collect(), purpose)
}

/// Collapses any hardening marker (`h`, `H`, `p`, `P`, `'`) to `'`.
pub fn normalize_segment(segment: &str) -> Result<String> {
    let segment = segment.trim();
    if segment.is_empty() {
        return Err(WalletError::Path("Empty path segment".to_string()));
    }
    if segment == "m" || segment == "M" {
        return Ok(segment.to_string());
    }
    let (body, marked) = split_marker(segment);
    if body.is_empty() {
        return Err(WalletError::Path(format!("Malformed path segment {}", segment)));
    }
    Ok(if marked {
        format!("{}{}", body, HARDENED_MARK)
    } else {
        body.to_string()
    })
}

fn split_marker(segment: &str) -> (&str, bool) {
    if let Some(body) = segment.strip_suffix(HARDENED_MARK) {
        return (body, true);
    }
    let mut chars = segment.chars();
    match chars.next_back() {
        Some('h' | 'H' | 'p' | 'P') if !chars.as_str().is_empty() && chars.as_str().bytes().all(|b| b.is_ascii_digit()) => {
            (chars.as_str(), true)
        }
        _ => (segment, false),
    }
}

/// Splits a `/` separated path and normalizes every segment.
pub fn parse_path(path: &str) -> Result<Vec<String>> {
    path.split('/').map(normalize_segment).collect()
}

pub fn path_to_string(path: &[String]) -> String {
    path.join("/")
}

/// Child number for a concrete segment, hardened offset applied.
pub fn child_number(segment: &str) -> Result<u32> {
    let (body, marked) = split_marker(segment);
    let index: u32 = body
        .parse()
        .map_err(|_| WalletError::Path(format!("Invalid path index {}", segment)))?;
    if index >= BIP32_HARDENED_KEY_LIMIT {
        return Err(WalletError::Path(format!("Path index {} out of range", index)));
    }
    Ok(if marked { hardened(index) } else { index })
}

/// True for `m`/`M` rooted paths.
pub fn is_absolute(path: &[String]) -> bool {
    matches!(path.first().map(String::as_str), Some("m" | "M"))
}

/// Position of `token` in the template, or a path error naming it.
pub fn require_token(template: &[String], token: &str) -> Result<usize> {
    template
        .iter()
        .position(|s| s.trim_end_matches(HARDENED_MARK) == token)
        .ok_or_else(|| {
            WalletError::Path(format!(
                "Token {} not found in key path {}",
                token,
                path_to_string(template)
            ))
        })
}

/// Depth of the deepest hardened level, where public keys are shared with
/// cosigners and watch-only wallets. Zero for templates without one.
pub fn public_master_depth(template: &[String]) -> usize {
    template
        .iter()
        .rposition(|s| s.ends_with(HARDENED_MARK))
        .unwrap_or(0)
}

/// Truncates a template according to `level_offset`.
pub fn apply_level_offset(template: &[String], level_offset: Option<i32>) -> Result<&[String]> {
    match level_offset {
        None | Some(0) => Ok(template),
        Some(offset) if offset < 0 => {
            let drop = offset.unsigned_abs() as usize;
            if drop >= template.len() {
                return Err(WalletError::Path(format!(
                    "Level offset {} exceeds key path depth {}",
                    offset,
                    template.len() - 1
                )));
            }
            Ok(&template[..template.len() - drop])
        }
        Some(offset) => Ok(&template[..(offset as usize).min(template.len())]),
    }
}

/// Expands `partial` against `template`. Explicit values fill the template
/// from the end; the remaining positions take their token value from `ctx`.
pub fn expand(
    partial: &[String],
    template: &[String],
    level_offset: Option<i32>,
    ctx: &PathContext,
) -> Result<Vec<String>> {
    let absolute = is_absolute(partial);
    let skeleton: &[String] = if absolute && partial.len() != template.len() {
        partial
    } else if absolute {
        template
    } else {
        apply_level_offset(template, level_offset)?
    };
    if !absolute && partial.len() >= skeleton.len() {
        return Err(WalletError::Path(format!(
            "Path {} has more levels than key path {} allows",
            path_to_string(partial),
            path_to_string(skeleton)
        )));
    }

    let mut explicit = partial.to_vec();
    let mut filled: Vec<String> = Vec::with_capacity(skeleton.len());
    for token in skeleton.iter().rev() {
        filled.push(explicit.pop().unwrap_or_else(|| token.clone()));
    }
    filled.reverse();

    filled
        .iter()
        .enumerate()
        .map(|(i, segment)| {
            let segment = normalize_segment(segment)?;
            if segment == "m" || segment == "M" {
                return Ok(segment);
            }
            let (name, marked) = split_marker(&segment);
            let template_hardened = !absolute
                && template
                    .get(i)
                    .map(|t| t.ends_with(HARDENED_MARK))
                    .unwrap_or(false);
            let value = if name.bytes().all(|b| b.is_ascii_digit()) {
                name.to_string()
            } else if TOKENS.contains(&name) {
                ctx.value_of(name)?
                    .ok_or_else(|| {
                        WalletError::Path(format!("No value available for path variable {}", name))
                    })?
                    .to_string()
            } else {
                return Err(WalletError::Path(format!(
                    "Variable {} not found in key structure definitions",
                    name
                )));
            };
            let segment = if marked || template_hardened {
                format!("{}{}", value, HARDENED_MARK)
            } else {
                value
            };
            child_number(&segment)?;
            Ok(segment)
        })
        .collect()
}

/// Generated name of an intermediate key, e.g. `account 0` or `address index 5`.
pub fn level_name(template_token: &str, segment: &str) -> String {
    format!("{} {}", template_token, segment)
        .replace(HARDENED_MARK, "")
        .replace('_', " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PathContext {
        PathContext {
            network: Network::Bitcoin,
            purpose: 44,
            account_id: 0,
            witness_type: WitnessType::Legacy,
            cosigner_id: None,
            change: 0,
            address_index: 0,
        }
    }

    fn segs(path: &[&str]) -> Vec<String> {
        path.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_expand_change_and_index() {
        let (template, _) = template_for(Scheme::Bip32, WitnessType::Legacy, false);
        let path = expand(&segs(&["0", "5"]), &template, None, &ctx()).unwrap();
        assert_eq!(path_to_string(&path), "m/44'/0'/0'/0/5");
        assert_eq!(&path[path.len() - 2..], &segs(&["0", "5"])[..]);
    }

    #[test]
    fn test_explicit_values_win_over_context() {
        let (template, _) = template_for(Scheme::Bip32, WitnessType::Segwit, false);
        let mut c = ctx();
        c.purpose = 84;
        c.change = 1;
        c.address_index = 9;
        let path = expand(&segs(&["0", "5"]), &template, None, &c).unwrap();
        assert_eq!(path_to_string(&path), "m/84'/0'/0'/0/5");
        let defaults = expand(&[], &template, None, &c).unwrap();
        assert_eq!(path_to_string(&defaults), "m/84'/0'/0'/1/9");
    }

    #[test]
    fn test_negative_level_offset_reaches_account_key() {
        let (template, _) = template_for(Scheme::Bip32, WitnessType::Legacy, false);
        let mut c = ctx();
        c.account_id = 3;
        c.network = Network::Testnet;
        let path = expand(&[], &template, Some(-2), &c).unwrap();
        assert_eq!(path_to_string(&path), "m/44'/1'/3'");
        let prefix = expand(&[], &template, Some(2), &c).unwrap();
        assert_eq!(path_to_string(&prefix), "m/44'");
        assert!(expand(&[], &template, Some(-6), &c).is_err());
    }

    #[test]
    fn test_relative_path_longer_than_template_is_rejected() {
        let (template, _) = template_for(Scheme::Bip32, WitnessType::Legacy, false);
        let too_long = segs(&["1", "2", "3", "4", "5", "6"]);
        assert!(matches!(expand(&too_long, &template, None, &ctx()), Err(WalletError::Path(_))));
        // Account level template m/44'/0'/0' leaves room for two values only.
        assert!(matches!(
            expand(&segs(&["7", "0", "5"]), &template, Some(-2), &ctx()),
            Err(WalletError::Path(_))
        ));
        let path = expand(&segs(&["7", "0"]), &template, Some(-2), &ctx()).unwrap();
        assert_eq!(path_to_string(&path), "m/44'/7'/0'");
    }

    #[test]
    fn test_multisig_templates() {
        let (legacy, purpose) = template_for(Scheme::Bip32, WitnessType::Legacy, true);
        assert_eq!(purpose, 45);
        let mut c = ctx();
        c.purpose = 45;
        assert!(matches!(
            expand(&segs(&["0", "1"]), &legacy, None, &c),
            Err(WalletError::Path(_))
        ));
        c.cosigner_id = Some(2);
        assert_eq!(
            path_to_string(&expand(&segs(&["0", "1"]), &legacy, None, &c).unwrap()),
            "m/45'/2/0/1"
        );

        let (segwit, purpose) = template_for(Scheme::Bip32, WitnessType::P2shSegwit, true);
        assert_eq!(purpose, 48);
        c.purpose = 48;
        c.witness_type = WitnessType::P2shSegwit;
        assert_eq!(
            path_to_string(&expand(&segs(&["1", "4"]), &segwit, None, &c).unwrap()),
            "m/48'/0'/0'/1'/1/4"
        );
    }

    #[test]
    fn test_public_master_depth_per_layout() {
        let depth = |scheme, witness_type, multisig| {
            public_master_depth(&template_for(scheme, witness_type, multisig).0)
        };
        assert_eq!(depth(Scheme::Bip32, WitnessType::Segwit, false), 3);
        assert_eq!(depth(Scheme::Bip32, WitnessType::Legacy, true), 1);
        assert_eq!(depth(Scheme::Bip32, WitnessType::P2shSegwit, true), 4);
        assert_eq!(depth(Scheme::Single, WitnessType::Legacy, false), 0);
    }

    #[test]
    fn test_hardening_markers_are_normalized() {
        assert_eq!(
            parse_path("m/44h/0H/1p/2P/3'").unwrap(),
            segs(&["m", "44'", "0'", "1'", "2'", "3'"])
        );
        assert!(matches!(parse_path("m//0"), Err(WalletError::Path(_))));
        assert!(normalize_segment("'").is_err());
        // Marker letters only count as hardening after digits.
        assert_eq!(normalize_segment("change").unwrap(), "change");
    }

    #[test]
    fn test_unknown_variable_and_range() {
        let (template, _) = template_for(Scheme::Bip32, WitnessType::Legacy, false);
        assert!(matches!(
            expand(&segs(&["foo", "1"]), &template, None, &ctx()),
            Err(WalletError::Path(_))
        ));
        assert!(child_number("2147483648").is_err());
        assert_eq!(child_number("0'").unwrap(), 0x8000_0000);
    }

    #[test]
    fn test_absolute_path_is_kept() {
        let (template, _) = template_for(Scheme::Bip32, WitnessType::Legacy, false);
        let path = expand(&parse_path("m/44'/0'/1'").unwrap(), &template, Some(-2), &ctx()).unwrap();
        assert_eq!(path_to_string(&path), "m/44'/0'/1'");
    }

    #[test]
    fn test_require_token_and_level_name() {
        let (template, _) = template_for(Scheme::Bip32, WitnessType::Legacy, true);
        assert!(matches!(
            require_token(&template, "account"),
            Err(WalletError::Path(_))
        ));
        let (template, _) = template_for(Scheme::Bip32, WitnessType::Legacy, false);
        assert_eq!(require_token(&template, "account").unwrap(), 3);
        assert_eq!(level_name("account'", "0'"), "account 0");
        assert_eq!(level_name("address_index", "5"), "address index 5");
    }
}
