//! Auto-generated per-pod credentials.
//!
//! A Password row is one-to-one with its Pod, created in the same transaction
//! and deleted when the Pod is deleted. Plaintext is write-once and only ever
//! readable through the dedicated password endpoint, never via the pod read
//! path.

use crate::types::PodId;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;

/// Length of generated credentials.
const PASSWORD_LENGTH: usize = 24;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Password {
    pub pod_id: PodId,
    pub admin_username: String,
    pub admin_password: String,
    pub user_username: String,
    pub user_password: String,
    pub created_at: DateTime<Utc>,
}

impl Password {
    /// Generate fresh random credentials for a pod: an admin account and a
    /// per-pod user account.
    pub fn generate(pod_id: &PodId) -> Self {
        Self {
            pod_id: pod_id.clone(),
            admin_username: "admin".to_string(),
            admin_password: random_password(),
            user_username: format!("{pod_id}user"),
            user_password: random_password(),
            created_at: Utc::now(),
        }
    }
}

fn random_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_credentials_are_distinct_and_sized() {
        let password = Password::generate(&"graph1".to_string());
        assert_eq!(password.admin_password.len(), PASSWORD_LENGTH);
        assert_eq!(password.user_password.len(), PASSWORD_LENGTH);
        assert_ne!(password.admin_password, password.user_password);
        assert_eq!(password.user_username, "graph1user");

        let other = Password::generate(&"graph1".to_string());
        assert_ne!(password.admin_password, other.admin_password);
    }
}
