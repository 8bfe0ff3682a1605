//! Identifier generation.

use uuid::Uuid;

/// Generates a document `_id`: a random 128-bit UUID in canonical form.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generates a savepoint name safe to use as a SQL identifier.
///
/// The simple (hyphen-free) UUID form keeps the name unique per nesting
/// level without quoting.
pub fn savepoint_name() -> String {
    format!("sp_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_canonical_uuids() {
        let id = generate_id();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(id.len(), 36);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
    }

    #[test]
    fn savepoint_names_are_identifiers() {
        let name = savepoint_name();
        assert!(name.starts_with("sp_"));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }
}
