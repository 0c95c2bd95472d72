use rand::{distributions::Alphanumeric, thread_rng, Rng};

/// Utility functions for random generation
pub struct RngUtils;

impl RngUtils {
    /// Generate a random string of default length (16 characters)
    pub fn random_string() -> String {
        Self::random_string_with_length(16)
    }

    /// Generate a random string of specified length using alphanumeric characters
    pub fn random_string_with_length(length: usize) -> String {
        thread_rng()
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect()
    }

    /// Generate a random u64
    pub fn random_u64() -> u64 {
        thread_rng().gen()
    }

    /// Generate an instance name like `log-provider-4Fz9...` for a base name
    pub fn instance_name(base: &str) -> String {
        format!("{}-{}", base, Self::random_string_with_length(8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_random_string_lengths() {
        assert_eq!(RngUtils::random_string().len(), 16);
        for len in [0, 1, 8, 64] {
            let s = RngUtils::random_string_with_length(len);
            assert_eq!(s.len(), len);
            assert!(s.chars().all(|c| c.is_alphanumeric()));
        }
    }

    #[test]
    fn test_random_string_uniqueness() {
        let mut strings = HashSet::new();
        for _ in 0..100 {
            strings.insert(RngUtils::random_string_with_length(8));
        }
        assert!(strings.len() > 95, "got {} unique strings", strings.len());
    }

    #[test]
    fn test_instance_name() {
        let name = RngUtils::instance_name("log-provider");
        assert!(name.starts_with("log-provider-"));
        assert_eq!(name.len(), "log-provider-".len() + 8);
    }

    #[test]
    fn test_random_u64() {
        let a = RngUtils::random_u64();
        let b = RngUtils::random_u64();
        assert_ne!(a, b, "two random u64s should differ");
    }
}
