//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::EngineError;

/// Cloneable cancellation flag shared between a caller and one operation.
///
/// The engine only looks at it between units of work: between files in the
/// copy engine, between chunks in the block imager and between polls in the
/// job monitor.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with `Cancelled` if cancellation was requested.
    pub fn check(&self, operation: &str) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled {
                operation: operation.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_clones_share_the_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check("copy").is_ok());

        clone.cancel();

        assert!(token.is_cancelled());
        let err = token.check("copy").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
