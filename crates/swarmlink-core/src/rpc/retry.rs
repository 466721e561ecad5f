//! Retry bookkeeping for one logical RPC operation.

use tracing::debug;

use crate::error::SwarmError;
use crate::types::Node;

/// Tracks attempts and the nodes already tried by one operation.
///
/// ```ignore
/// let mut attempts = Attempts::new(max_retry_count);
/// while attempts.begin() {
///     let Some(node) = pick(attempts.used()) else { break };
///     attempts.mark_used(node.clone());
///     match call(&node).await {
///         Ok(v) => return Ok(v),
///         Err(e) if e.is_retryable() => attempts.fail(e),
///         Err(e) => return Err(e),
///     }
/// }
/// Err(attempts.exhausted("store"))
/// ```
#[derive(Debug)]
pub struct Attempts {
    max: usize,
    made: usize,
    used: Vec<Node>,
    last_error: Option<SwarmError>,
}

impl Attempts {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            made: 0,
            used: Vec::new(),
            last_error: None,
        }
    }

    /// Start another attempt if the budget allows it.
    pub fn begin(&mut self) -> bool {
        if self.made >= self.max {
            return false;
        }
        self.made += 1;
        true
    }

    pub fn made(&self) -> usize {
        self.made
    }

    pub fn used(&self) -> &[Node] {
        &self.used
    }

    pub fn mark_used(&mut self, node: Node) {
        self.used.push(node);
    }

    pub fn fail(&mut self, error: SwarmError) {
        debug!(attempt = self.made, max = self.max, error = %error, "RPC attempt failed");
        self.last_error = Some(error);
    }

    /// The error to surface once no attempt is left. Node faults are folded
    /// into `Generic` so they never escape the RPC layer.
    pub fn exhausted(self, operation: &str) -> SwarmError {
        let cause = self
            .last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no usable node".to_string());
        SwarmError::Generic(format!(
            "{} failed after {} attempt(s): {}",
            operation, self.made, cause
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_is_exact() {
        let mut attempts = Attempts::new(6);
        let mut count = 0;
        while attempts.begin() {
            count += 1;
            attempts.fail(SwarmError::NodeFault {
                status: 502,
                message: "down".into(),
            });
        }
        assert_eq!(count, 6);
        let err = attempts.exhausted("retrieve");
        assert!(matches!(err, SwarmError::Generic(ref m) if m.contains("6 attempt")));
    }

    #[test]
    fn test_exhausted_without_attempts() {
        let err = Attempts::new(3).exhausted("store");
        assert!(err.to_string().contains("no usable node"));
    }
}
