/// Input validation for settlement requests and queue names
///
/// Everything here runs before any broker interaction, so a malformed
/// request never produces a half-sent pair.
use crate::domain::SettlementRequest;
use crate::error::{Result, SyncError};
use rust_decimal::Decimal;

/// Broker limit on a queue name, excluding host and prefix
pub const MAX_QUEUE_NAME_LEN: usize = 124;

/// Maximum security identifier length (ISIN is 12)
pub const MAX_SECURITY_ID_LEN: usize = 12;

const PRIVATE_PREFIX: &str = "private$\\";

/// Validate a queue name
///
/// A leading `private$\` is accepted; any other path separator is not.
pub fn validate_queue_name(name: &str) -> Result<()> {
    let bare = strip_private_prefix(name);

    if bare.trim().is_empty() {
        return Err(SyncError::Validation(
            "Queue name cannot be empty".to_string(),
        ));
    }

    if bare.chars().count() > MAX_QUEUE_NAME_LEN {
        return Err(SyncError::Validation(format!(
            "Queue name exceeds {} characters: {}",
            MAX_QUEUE_NAME_LEN, name
        )));
    }

    if bare.contains('\\') || bare.contains('/') {
        return Err(SyncError::Validation(format!(
            "Queue name contains a path separator: {}",
            name
        )));
    }

    Ok(())
}

fn strip_private_prefix(name: &str) -> &str {
    match name.get(..PRIVATE_PREFIX.len()) {
        Some(head) if head.eq_ignore_ascii_case(PRIVATE_PREFIX) => &name[PRIVATE_PREFIX.len()..],
        _ => name,
    }
}

/// Validate a settlement request
///
/// Collects every problem instead of stopping at the first one, so the
/// caller sees the full list in a single `SyncError::Validation`.
pub fn validate_settlement_request(request: &SettlementRequest) -> Result<()> {
    let mut errors = Vec::new();

    let security = request.security_id.trim();
    if security.is_empty() {
        errors.push("security id cannot be empty".to_string());
    } else if security.len() > MAX_SECURITY_ID_LEN
        || !security.chars().all(|c| c.is_ascii_alphanumeric())
    {
        errors.push(format!(
            "security id must be at most {} alphanumeric characters: {}",
            MAX_SECURITY_ID_LEN, request.security_id
        ));
    }

    if request.quantity <= Decimal::ZERO {
        errors.push(format!("quantity must be positive: {}", request.quantity));
    }

    for (role, code) in [("seller", &request.seller), ("buyer", &request.buyer)] {
        if let Err(e) = validate_participant_code(code) {
            errors.push(format!("{}: {}", role, e));
        }
    }
    if !request.seller.is_empty() && request.seller == request.buyer {
        errors.push(format!(
            "seller and buyer must differ: {}",
            request.seller
        ));
    }

    if request.settlement_date < request.trade_date {
        errors.push(format!(
            "settlement date {} is before trade date {}",
            request.settlement_date, request.trade_date
        ));
    }

    if let Err(SyncError::Validation(msg)) = validate_queue_name(&request.queue_name) {
        errors.push(msg);
    }

    if let Some(correlation_id) = &request.correlation_id {
        if correlation_id.trim().is_empty() {
            errors.push("correlation id cannot be blank when supplied".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(SyncError::Validation(errors.join("; ")))
    }
}

/// Participant codes are numeric account identifiers
fn validate_participant_code(code: &str) -> std::result::Result<(), String> {
    if code.is_empty() {
        return Err("participant code cannot be empty".to_string());
    }
    if !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("participant code must be numeric: {}", code));
    }
    Ok(())
}
