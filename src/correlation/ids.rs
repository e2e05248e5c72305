//! Transaction id scheme
//!
//! `base` is `YYYYMMDD-` followed by 8 random uppercase alphanumerics.
//! Settlement legs append `-R` (RECE) or `-D` (DELI) to a shared base and
//! the pair's correlation id is `CR-<base>` unless the caller supplies one.

use chrono::NaiveDate;
use rand::Rng;

use crate::domain::MovementType;

const SUFFIX_LEN: usize = 8;
const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Prefix for records created from unrecognized inbound messages
pub const INBOUND_PREFIX: &str = "IN-";

/// Prefix for generated correlation ids
pub const CORRELATION_PREFIX: &str = "CR-";

/// Ids for both legs of one settlement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairIds {
    pub base: String,
    pub rece: String,
    pub deli: String,
    pub correlation: String,
}

impl PairIds {
    pub fn generate(date: NaiveDate, correlation: Option<&str>) -> Self {
        Self::from_base(generate_base(date), correlation)
    }

    pub fn from_base(base: String, correlation: Option<&str>) -> Self {
        Self {
            rece: leg_id(&base, MovementType::Rece),
            deli: leg_id(&base, MovementType::Deli),
            correlation: correlation
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}{}", CORRELATION_PREFIX, base)),
            base,
        }
    }
}

pub fn generate_base(date: NaiveDate) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("{}-{}", date.format("%Y%m%d"), suffix)
}

/// Leg id for a base; non-leg movements use the base unchanged
pub fn leg_id(base: &str, movement: MovementType) -> String {
    match movement {
        MovementType::Rece => format!("{}-R", base),
        MovementType::Deli => format!("{}-D", base),
        MovementType::General | MovementType::System => base.to_string(),
    }
}

/// Recover the shared base from a leg id
pub fn base_of(transaction_id: &str) -> &str {
    transaction_id
        .strip_suffix("-R")
        .or_else(|| transaction_id.strip_suffix("-D"))
        .unwrap_or(transaction_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 2).unwrap()
    }

    #[test]
    fn base_has_date_prefix_and_random_suffix() {
        let base = generate_base(date());
        let (day, suffix) = base.split_once('-').unwrap();
        assert_eq!(day, "20240502");
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn legs_share_a_base() {
        let ids = PairIds::from_base("20240502-ABCD1234".into(), None);
        assert_eq!(ids.rece, "20240502-ABCD1234-R");
        assert_eq!(ids.deli, "20240502-ABCD1234-D");
        assert_eq!(ids.correlation, "CR-20240502-ABCD1234");
        assert_eq!(base_of(&ids.rece), base_of(&ids.deli));
    }

    #[test]
    fn supplied_correlation_is_kept() {
        let ids = PairIds::generate(date(), Some("TRADE-77"));
        assert_eq!(ids.correlation, "TRADE-77");
        assert_ne!(ids.rece, ids.deli);
    }

    #[test]
    fn generated_bases_differ() {
        assert_ne!(generate_base(date()), generate_base(date()));
    }
}
