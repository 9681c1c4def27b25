use nozzle_common::event::EventKind;

/// Allow-set of event kinds, fixed at construction.
///
/// Backed by a bitmask over [`EventKind::ALL`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EventTypeFilter {
    allowed: u8,
}

fn bit(kind: EventKind) -> u8 {
    1 << (kind as u8)
}

impl EventTypeFilter {
    pub fn new<I>(kinds: I) -> Self
    where
        I: IntoIterator<Item = EventKind>,
    {
        let allowed = kinds.into_iter().fold(0, |mask, kind| mask | bit(kind));
        Self { allowed }
    }

    pub fn accepts(&self, kind: EventKind) -> bool {
        self.allowed & bit(kind) != 0
    }

    /// Retained kinds, in taxonomy order. Used to ask the firehose for server-side filtering.
    pub fn kinds(&self) -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|kind| self.accepts(*kind))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed == 0
    }
}
