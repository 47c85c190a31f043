/// The client's view of backend reachability, derived from watch stream
/// health rather than any platform connectivity signal.
///
/// Every snapshot carries a from-cache bit keyed off this state, so the
/// transitions are deliberately conservative: `Online` requires an actual
/// message on the stream, while `Offline` requires repeated failures or a
/// connection attempt that never produced one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    /// No evidence either way. The initial state, and the state after
    /// credential changes or network toggles until the stream settles.
    Unknown,
    /// The watch stream recently delivered a message.
    Online,
    /// The stream failed enough times, or took too long to produce a
    /// message, that listens are served from cache.
    Offline,
}

impl Default for OnlineState {
    fn default() -> Self {
        OnlineState::Unknown
    }
}
