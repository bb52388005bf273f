//! Predicates relating a matched identifier to candidate identifiers.

/// Decides whether `candidate` is covered by a hit on `ancestor`.
pub trait Equality: Send + Sync {
    /// Whether `candidate` is `ancestor` or lies beneath it.
    fn covers(&self, ancestor: &[u8], candidate: &[u8]) -> bool;
}

/// Dotted-hierarchy ancestry: `a.1` covers itself, `a.1.1` and `a.1.2.1`,
/// but not `a.10`.
#[derive(Clone, Copy, Debug, Default)]
pub struct AncestorEquality;

impl Equality for AncestorEquality {
    fn covers(&self, ancestor: &[u8], candidate: &[u8]) -> bool {
        match candidate.strip_prefix(ancestor) {
            Some(rest) => rest.is_empty() || rest[0] == b'.',
            None => false,
        }
    }
}
