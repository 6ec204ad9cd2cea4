//! Per-request caller validation.
//!
//! Every RPC's first action is a `validate` call. The trait exists so a
//! token check or mTLS identity extraction can be swapped in without
//! touching the adapters.

use crate::error::{Error, Result};

pub trait AuthValidator: Send + Sync + 'static {
    fn validate(&self, user_id: &str) -> Result<()>;
}

/// The default validator: a caller is whoever they claim to be, as long as
/// they claim to be someone.
#[derive(Debug, Clone, Default)]
pub struct RequireUserId;

impl AuthValidator for RequireUserId {
    fn validate(&self, user_id: &str) -> Result<()> {
        if user_id.trim().is_empty() {
            Err(Error::PermissionDenied("user_id is required".to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_user_is_denied() {
        assert!(matches!(
            RequireUserId.validate(""),
            Err(Error::PermissionDenied(_))
        ));
        assert!(matches!(
            RequireUserId.validate("   "),
            Err(Error::PermissionDenied(_))
        ));
        assert!(RequireUserId.validate("alice").is_ok());
    }
}
