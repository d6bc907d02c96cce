use uuid::Uuid;

/// 32 lowercase hex characters.
pub fn mint_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// 16 lowercase hex characters.
pub fn mint_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

pub fn mint_alert_id() -> String {
    format!("alert_{}", Uuid::new_v4().simple())
}

pub fn mint_notification_id() -> String {
    format!("notification_{}", Uuid::new_v4().simple())
}

pub fn is_hex_id(input: &str, len: usize) -> bool {
    input.len() == len && input.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_have_expected_shape() {
        assert!(is_hex_id(&mint_trace_id(), 32));
        assert!(is_hex_id(&mint_span_id(), 16));
        assert!(mint_alert_id().starts_with("alert_"));
        assert_ne!(mint_span_id(), mint_span_id());
    }

    #[test]
    fn rejects_bad_ids() {
        assert!(!is_hex_id("abc", 16));
        assert!(!is_hex_id("zzzzzzzzzzzzzzzz", 16));
    }
}
