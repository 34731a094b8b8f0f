//! Domain entity models persisted by the entity store.

pub mod passwords;
pub mod pods;
pub mod snapshots;
pub mod volumes;

/// Validate a tenant-scoped entity id: lowercase alphanumeric, 3-64 chars.
///
/// Entity ids appear in workload names, schema-scoped primary keys, and
/// filesystem paths, so the character set is deliberately narrow.
pub fn validate_entity_id(id: &str) -> Result<(), String> {
    if id.len() < 3 || id.len() > 64 {
        return Err(format!("id '{id}' must be between 3 and 64 characters"));
    }
    if !id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err(format!("id '{id}' may only contain lowercase letters and digits"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ids_are_constrained() {
        assert!(validate_entity_id("abc").is_ok());
        assert!(validate_entity_id("pod1").is_ok());
        assert!(validate_entity_id("ab").is_err());
        assert!(validate_entity_id(&"a".repeat(65)).is_err());
        assert!(validate_entity_id("Pod1").is_err());
        assert!(validate_entity_id("pod-1").is_err());
        assert!(validate_entity_id("pod_1").is_err());
    }
}
