//! Application lifecycle events that schedule drains.

/// A host event that may warrant a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The app came to the foreground.
    Foreground,
    /// The app is about to be suspended.
    Background,
    /// The host granted a periodic background wake.
    PeriodicWake,
    /// The peer's reachability changed.
    ReachabilityChanged {
        /// Whether the peer is now reachable.
        reachable: bool,
    },
}

impl LifecycleEvent {
    /// Returns true if the relay should drain on this event.
    ///
    /// Losing reachability is the only event that does not drain: the
    /// durable lane would still accept items, but the last drain already
    /// submitted everything pending.
    pub fn triggers_drain(&self) -> bool {
        !matches!(self, LifecycleEvent::ReachabilityChanged { reachable: false })
    }

    /// Returns true if the peer just became reachable.
    pub fn is_reconnect(&self) -> bool {
        matches!(self, LifecycleEvent::ReachabilityChanged { reachable: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_triggers() {
        assert!(LifecycleEvent::Foreground.triggers_drain());
        assert!(LifecycleEvent::Background.triggers_drain());
        assert!(LifecycleEvent::PeriodicWake.triggers_drain());
        assert!(LifecycleEvent::ReachabilityChanged { reachable: true }.triggers_drain());
        assert!(!LifecycleEvent::ReachabilityChanged { reachable: false }.triggers_drain());
    }

    #[test]
    fn reconnect() {
        assert!(LifecycleEvent::ReachabilityChanged { reachable: true }.is_reconnect());
        assert!(!LifecycleEvent::Foreground.is_reconnect());
    }
}
