use std::fmt;

use uuid::Uuid;

/// Opaque token for a running sensor watch or store subscription.
///
/// Owned by whichever component handed it out, giving it back to that component's `stop` releases
/// the underlying resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(Uuid);

impl WatchHandle {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch {}", self.0)
    }
}
