/// Monotonic sequence numbers ordering all local operations, used by the
/// LRU reference delegate to age targets and orphaned documents.
pub type ListenSequenceNumber = i64;

#[derive(Debug)]
pub struct ListenSequence {
    previous: ListenSequenceNumber,
}

impl ListenSequence {
    pub const INVALID: ListenSequenceNumber = -1;

    pub fn new(starting_after: ListenSequenceNumber) -> Self {
        Self {
            previous: starting_after,
        }
    }

    pub fn next(&mut self) -> ListenSequenceNumber {
        self.previous += 1;
        self.previous
    }
}
