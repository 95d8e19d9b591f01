//! Completion delivery to the application.

/// One completed operation, handed to the [`CompletionHandler`].
///
/// The payload view borrows the broker's arena and is only valid for the
/// duration of the call: for received messages the slot is reposted as a
/// receive buffer immediately after the handler returns, and for finished
/// sends the slot rejoins the rotation. Handlers must copy out anything
/// they keep.
#[derive(Debug)]
pub enum Completion<'a> {
    /// A two-sided send finished.
    SendDone {
        /// Server id of the destination peer.
        peer: u32,
        /// Send slot the operation occupied.
        slot: u64,
        /// The slot's buffer.
        payload: &'a [u8],
        /// Immediate tag the operation was posted with; 0 when none.
        imm: u32,
    },
    /// A one-sided remote write finished.
    WriteDone {
        peer: u32,
        slot: u64,
        payload: &'a [u8],
        imm: u32,
    },
    /// A one-sided remote read finished; the local buffer now holds the
    /// remote data.
    ReadDone {
        peer: u32,
        slot: u64,
        payload: &'a [u8],
        imm: u32,
    },
    /// A message arrived in a receive slot.
    Received {
        /// Server id of the sending peer.
        peer: u32,
        /// Receive slot the message landed in.
        slot: u64,
        /// The received bytes.
        payload: &'a [u8],
        /// Immediate tag carried by the message; 0 when none was sent.
        imm: u32,
    },
}

impl Completion<'_> {
    /// Server id of the remote peer the completion concerns.
    pub fn peer(&self) -> u32 {
        match self {
            Completion::SendDone { peer, .. }
            | Completion::WriteDone { peer, .. }
            | Completion::ReadDone { peer, .. }
            | Completion::Received { peer, .. } => *peer,
        }
    }

    /// Slot id of the completion.
    pub fn slot(&self) -> u64 {
        match self {
            Completion::SendDone { slot, .. }
            | Completion::WriteDone { slot, .. }
            | Completion::ReadDone { slot, .. }
            | Completion::Received { slot, .. } => *slot,
        }
    }

    /// Immediate tag carried by the completion; 0 when none.
    pub fn imm(&self) -> u32 {
        match self {
            Completion::SendDone { imm, .. }
            | Completion::WriteDone { imm, .. }
            | Completion::ReadDone { imm, .. }
            | Completion::Received { imm, .. } => *imm,
        }
    }
}

/// Receives one call per completed operation during poll draining.
pub trait CompletionHandler {
    fn on_completion(&mut self, completion: Completion<'_>);
}

/// Handler that discards every completion.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopHandler;

impl CompletionHandler for NopHandler {
    fn on_completion(&mut self, _completion: Completion<'_>) {}
}

impl<F> CompletionHandler for F
where
    F: FnMut(Completion<'_>),
{
    fn on_completion(&mut self, completion: Completion<'_>) {
        self(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_handler() {
        let mut seen = Vec::new();
        {
            let mut handler = |completion: Completion<'_>| {
                seen.push((completion.peer(), completion.slot()));
            };
            handler.on_completion(Completion::Received {
                peer: 3,
                slot: 1,
                payload: b"hi",
                imm: 0,
            });
        }
        assert_eq!(seen, vec![(3, 1)]);
    }
}
